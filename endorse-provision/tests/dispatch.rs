//! Operation dispatch against a local provisioning stub.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};
use tempfile::tempdir;
use url::Url;

use endorse_client::{Config as EndorseConfig, KeyCacheConfig, UiccAuthResult, UiccInterface};
use endorse_provision::{Client, Config, ProvisionError};

const IMSI: &str = "001010000000001";
const CK: [u8; 16] = [0x5a; 16];

#[derive(Debug, Clone)]
struct RecordedRequest {
    path: String,
    headers: HashMap<String, String>,
    body: String,
}

struct ServiceStub {
    base: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl ServiceStub {
    fn start(respond: impl Fn(&RecordedRequest) -> (u16, String) + Send + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub listener");
        let base = format!("http://{}", listener.local_addr().expect("local addr"));
        let requests: Arc<Mutex<Vec<RecordedRequest>>> = Arc::default();

        let recorded = requests.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let Some(request) = read_request(&mut stream) else {
                    continue;
                };
                recorded.lock().expect("requests lock").push(request.clone());

                let (status, body) = respond(&request);
                let _ = write!(
                    stream,
                    "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
            }
        });

        ServiceStub { base, requests }
    }

    fn url(&self, path: &str) -> Url {
        Url::parse(&format!("{}{}", self.base, path)).expect("stub url")
    }

    fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

fn read_request(stream: &mut std::net::TcpStream) -> Option<RecordedRequest> {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).ok()?;
    let path = request_line.split_whitespace().nth(1)?.to_string();

    let mut headers = HashMap::new();
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).ok()?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim().to_string();
            if name == "content-length" {
                content_length = value.parse().ok()?;
            }
            headers.insert(name, value);
        }
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).ok()?;
    Some(RecordedRequest {
        path,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

struct FakeUicc;

impl UiccInterface for FakeUicc {
    fn read_imsi(&mut self) -> endorse_client::Result<String> {
        Ok(IMSI.to_string())
    }

    fn authenticate(
        &mut self,
        _rand: &[u8],
        _autn: &[u8],
    ) -> endorse_client::Result<UiccAuthResult> {
        Ok(UiccAuthResult::Success {
            res: vec![0x11; 8],
            ck: CK.to_vec(),
            ik: vec![0x33; 16],
            kc: vec![0x44; 8],
        })
    }

    fn close(&mut self) {}

    fn name(&self) -> &str {
        "fake-uicc"
    }
}

fn challenge_json(key_id: &str) -> String {
    format!(
        r#"{{"keyId":"{key_id}","rand":"{}","autn":"{}"}}"#,
        BASE64.encode([0xaa; 16]),
        BASE64.encode([0xbb; 16])
    )
}

fn client_against(stub: &ServiceStub, request_parameters: &str) -> Client {
    let dir = tempdir().expect("tempdir");
    let endorse_cfg = EndorseConfig {
        keys_api_endpoint_url: Some(stub.url("/v1/keys")),
        signature_algorithm: "SHA-256".to_string(),
        key_cache: KeyCacheConfig {
            disabled: true,
            clear: false,
            profile_dir: Some(dir.into_path()),
        },
        ..EndorseConfig::default()
    };
    let endorse =
        endorse_client::Client::with_interface(endorse_cfg, Box::new(FakeUicc)).expect("client");

    let cfg = Config {
        provisioning_api_endpoint_url: Some(stub.url("/")),
        request_parameters: request_parameters.to_string(),
    };
    Client::new(cfg, endorse).expect("provision client")
}

#[test]
fn unknown_operation_name_fails() {
    let _ = tracing_subscriber::fmt().try_init();
    let stub = ServiceStub::start(|_| (200, "{}".to_string()));
    let mut client = client_against(&stub, "");

    let err = client.perform_operation("nope").unwrap_err();
    assert!(matches!(err, ProvisionError::UnknownOperation(_)));
    assert!(err.to_string().contains("unknown operation name: nope"));
    assert!(stub.requests().is_empty());
}

#[test]
fn simple_operation_posts_a_signed_request() {
    let stub = ServiceStub::start(|req| match req.path.as_str() {
        "/v1/keys" => (200, challenge_json("k1")),
        "/v1/keys/k1/verify" => (200, "{}".to_string()),
        "/v1/provisioning/soracom/air/subscriber_metadata" => {
            (200, r#"{"imsi":"001010000000001"}"#.to_string())
        }
        _ => (404, "{}".to_string()),
    });

    let mut client = client_against(&stub, "");
    client.perform_operation("getSubscriberMetadata").unwrap();

    let requests = stub.requests();
    let provisioning = requests
        .iter()
        .find(|r| r.path.contains("subscriber_metadata"))
        .expect("provisioning request");

    assert_eq!(provisioning.body, r#"{"keyId":"k1"}"#);
    assert_eq!(
        provisioning.headers.get("content-type").map(String::as_str),
        Some("application/json")
    );
    assert_eq!(
        provisioning
            .headers
            .get("x-soracom-digest-algorithm")
            .map(String::as_str),
        Some("SHA-256")
    );

    // The signature header is the digest of body ‖ timestamp ‖ CK.
    let timestamp = provisioning
        .headers
        .get("x-soracom-timestamp")
        .expect("timestamp header");
    let mut concat = Vec::new();
    concat.extend_from_slice(provisioning.body.as_bytes());
    concat.extend_from_slice(timestamp.as_bytes());
    concat.extend_from_slice(&CK);
    assert_eq!(
        provisioning
            .headers
            .get("x-soracom-signature")
            .map(String::as_str),
        Some(BASE64.encode(Sha256::digest(&concat)).as_str())
    );
}

#[test]
fn simple_operation_embeds_request_parameters() {
    let stub = ServiceStub::start(|req| match req.path.as_str() {
        "/v1/keys" => (200, challenge_json("k1")),
        "/v1/keys/k1/verify" => (200, "{}".to_string()),
        _ => (200, "{}".to_string()),
    });

    let mut client = client_against(&stub, r#"{"group":"g1"}"#);
    client.perform_operation("getUserData").unwrap();

    let provisioning = stub
        .requests()
        .into_iter()
        .find(|r| r.path.contains("userdata"))
        .expect("provisioning request");
    assert_eq!(
        provisioning.body,
        r#"{"keyId":"k1","requestParameters":{"group":"g1"}}"#
    );
}

#[test]
fn simple_operation_accepts_status_400_but_not_above() {
    for (status, expect_ok) in [(400, true), (401, false), (500, false)] {
        let stub = ServiceStub::start(move |req| match req.path.as_str() {
            "/v1/keys" => (200, challenge_json("k1")),
            "/v1/keys/k1/verify" => (200, "{}".to_string()),
            _ => (status, "{}".to_string()),
        });

        let mut client = client_against(&stub, "");
        let result = client.perform_operation("getSubscriberMetadata");
        assert_eq!(result.is_ok(), expect_ok, "status {status}");
    }
}

#[test]
fn inventory_bootstrap_requires_an_endpoint_parameter() {
    let stub = ServiceStub::start(|_| (200, "{}".to_string()));
    let mut client = client_against(&stub, "");

    let err = client
        .perform_operation("bootstrapInventoryDevice")
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "parameter 'endpoint' must be specified in --params option"
    );
}

#[test]
fn inventory_bootstrap_derives_and_filters_the_response() {
    let nonce_b64 = BASE64.encode([0u8; 16]);
    let stub = ServiceStub::start(move |req| match req.path.as_str() {
        "/v1/keys" => (200, challenge_json("k1")),
        "/v1/keys/k1/verify" => (200, "{}".to_string()),
        "/v1/provisioning/soracom/inventory/bootstrap" => (
            200,
            format!(
                r#"{{"nonce":"{nonce_b64}","timestamp":"1700000000000","serverUri":"coaps://example.com","pskId":"psk-1","extra":"dropped"}}"#
            ),
        ),
        _ => (404, "{}".to_string()),
    });

    let mut client = client_against(&stub, r#"{"endpoint":"coap://example.com"}"#);
    client.perform_operation("bootstrapInventoryDevice").unwrap();

    let bootstrap = stub
        .requests()
        .into_iter()
        .find(|r| r.path.contains("inventory"))
        .expect("bootstrap request");
    assert!(bootstrap.body.contains(r#""endpoint":"coap://example.com""#));
    assert!(bootstrap.body.contains(r#""keyId":"k1""#));
}

//! Command line front-end: authenticate with the inserted SIM and perform
//! a provisioning operation, or inspect the locally available devices.

use std::process::ExitCode;

use clap::{CommandFactory, FromArgMatches, Parser};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

use endorse_client::{
    Config as EndorseConfig, EndorseError, KeyCacheConfig, ParityMode, SerialConfig,
    UiccInterfaceType,
};
use endorse_provision::Config as ProvisionConfig;

#[derive(Debug, Parser)]
#[command(
    name = "endorse-cli",
    about = "Authenticates with the inserted SIM and calls provisioning APIs",
    version
)]
struct Cli {
    /// Choose which type of provisioning API will be performed
    #[arg(long)]
    operation: Option<String>,

    /// Pass additional JSON parameters to the service request
    #[arg(long, short = 'p', default_value = "")]
    params: String,

    /// Use the specified URL as a Provisioning API endpoint
    #[arg(long = "provisioning-api-endpoint-url")]
    provisioning_api_endpoint_url: Option<String>,

    /// Use the specified URL as a Keys API endpoint
    #[arg(long = "keys-api-endpoint-url")]
    keys_api_endpoint_url: Option<String>,

    /// Algorithm for generating signature
    #[arg(long = "signature-algorithm", default_value = "SHA-256")]
    signature_algorithm: String,

    /// UICC interface to use. Valid values are iso7816, comm, mmcli or autoDetect
    #[arg(long, default_value = "autoDetect")]
    interface: String,

    /// Port name of communication device (e.g. COM1 or /dev/tty1)
    #[arg(long = "port-name", default_value = "")]
    port_name: String,

    /// Baud rate for communication device
    #[arg(long = "baud-rate", default_value_t = 57600)]
    baud_rate: u32,

    /// Data bits for communication device
    #[arg(long = "data-bits", default_value_t = 8)]
    data_bits: u8,

    /// Stop bits for communication device
    #[arg(long = "stop-bits", default_value_t = 1)]
    stop_bits: u8,

    /// Parity mode for communication device. 0: None, 1: Odd, 2: Even
    #[arg(long = "parity-mode", default_value_t = 0)]
    parity_mode: u8,

    /// List all available communication devices and exit
    #[arg(long = "list-com-ports")]
    list_com_ports: bool,

    /// Query the communication device and print the information
    #[arg(long = "device-info")]
    device_info: bool,

    /// Do not store authentication result to the key cache
    #[arg(long = "disable-key-cache")]
    disable_key_cache: bool,

    /// Remove all items in the key cache
    #[arg(long = "clear-key-cache")]
    clear_key_cache: bool,

    /// Show verbose debug messages
    #[arg(long)]
    debug: bool,
}

enum RunMode {
    ListComPorts,
    DeviceInfo,
    PerformOperation(String),
}

fn main() -> ExitCode {
    let cli = parse_cli();

    setup_logging(cli.debug);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn parse_cli() -> Cli {
    // The operation list lives in the registry, so the flag's long help is
    // generated at runtime.
    let cmd = Cli::command().mut_arg("operation", |a| {
        a.long_help(endorse_provision::operations_help_text())
    });
    let matches = cmd.get_matches();
    match Cli::from_arg_matches(&matches) {
        Ok(cli) => cli,
        Err(e) => e.exit(),
    }
}

fn setup_logging(debug: bool) {
    let fmt_layer = fmt::layer().with_writer(std::io::stderr);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("error")
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let (run_mode, endorse_cfg, provision_cfg) = build_configs(&cli)?;

    let mut endorse = endorse_client::Client::new(endorse_cfg)?;

    match run_mode {
        RunMode::ListComPorts => {
            let ports = endorse.list_com_ports()?;
            println!("{}", ports.join("\n"));
        }
        RunMode::DeviceInfo => {
            let info = endorse.device_info()?;
            println!("{info}");
        }
        RunMode::PerformOperation(name) => {
            let mut provision = endorse_provision::Client::new(provision_cfg, endorse)?;
            provision.perform_operation(&name)?;
        }
    }

    Ok(())
}

fn build_configs(cli: &Cli) -> Result<(RunMode, EndorseConfig, ProvisionConfig), EndorseError> {
    let keys_api_endpoint_url = match &cli.keys_api_endpoint_url {
        Some(u) => Some(Url::parse(u)?),
        None => None,
    };
    let provisioning_api_endpoint_url = match &cli.provisioning_api_endpoint_url {
        Some(u) => Some(Url::parse(u)?),
        None => None,
    };

    let mut uicc_interface_type: UiccInterfaceType = cli.interface.parse()?;

    let run_mode = if cli.list_com_ports {
        uicc_interface_type = UiccInterfaceType::None;
        RunMode::ListComPorts
    } else if cli.device_info {
        if cli.port_name.is_empty() {
            return Err(EndorseError::Config(
                "--port-name must be specified with --device-info".to_string(),
            ));
        }
        uicc_interface_type = UiccInterfaceType::Comm;
        RunMode::DeviceInfo
    } else {
        match &cli.operation {
            Some(name) if !name.is_empty() => RunMode::PerformOperation(name.clone()),
            _ => {
                return Err(EndorseError::Config(
                    "operation must be specified".to_string(),
                ))
            }
        }
    };

    let endorse_cfg = EndorseConfig {
        keys_api_endpoint_url,
        signature_algorithm: cli.signature_algorithm.clone(),
        uicc_interface_type,
        key_cache: KeyCacheConfig {
            disabled: cli.disable_key_cache,
            clear: cli.clear_key_cache,
            profile_dir: None,
        },
        serial: SerialConfig {
            port_name: cli.port_name.clone(),
            baud_rate: cli.baud_rate,
            data_bits: cli.data_bits,
            stop_bits: cli.stop_bits,
            parity_mode: ParityMode::from(cli.parity_mode),
        },
    };

    let provision_cfg = ProvisionConfig {
        provisioning_api_endpoint_url,
        request_parameters: cli.params.clone(),
    };

    Ok((run_mode, endorse_cfg, provision_cfg))
}

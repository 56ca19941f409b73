use std::env;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use sprocket_agent::config::Config;
use sprocket_agent::core::global_registry;
use sprocket_agent::{AgentError, run_container};
use sprocket_helpers::{logging, shutdown};
use sprocket_proto::ContainerArguments;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const EX_USER_FAILURE: u8 = 1;
const EX_BAD_ARGUMENTS: u8 = 2;

fn main() -> ExitCode {
    logging::init_logging(
        "sprocket_agent=info,tokio=warn",
        "SPROCKET_LOG",
        "sprocket-agent",
    );

    let container_args = match parse_container_args(env::args().skip(1)) {
        Ok(args) => args,
        Err(err) => {
            error!("invalid container arguments: error={err:#}");
            return ExitCode::from(EX_BAD_ARGUMENTS);
        }
    };

    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            error!("invalid environment: error={err:#}");
            return ExitCode::from(EX_BAD_ARGUMENTS);
        }
    };

    match run(container_args, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(AgentError::UserCodeFailed) => {
            info!("user exception reported, exiting");
            ExitCode::from(EX_USER_FAILURE)
        }
        Err(err) => {
            error!("container runtime failed: error={err}");
            ExitCode::from(EX_USER_FAILURE)
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn run(
    container_args: ContainerArguments,
    config: Config,
) -> Result<(), AgentError> {
    let shutdown_token = CancellationToken::new();
    tokio::spawn(shutdown::listen_shutdown(shutdown_token.clone()));
    run_container(
        container_args,
        config,
        global_registry(),
        shutdown_token,
    )
    .await
}

fn parse_container_args<I>(mut args: I) -> Result<ContainerArguments>
where
    I: Iterator<Item = String>,
{
    let encoded = args
        .next()
        .context("missing container arguments (usage: sprocket-agent <base64-args>)")?;
    if let Some(extra) = args.next() {
        bail!("too many arguments: {extra}");
    }

    let decoded = STANDARD
        .decode(encoded.trim().as_bytes())
        .context("container arguments are not valid base64")?;
    serde_json::from_slice(&decoded)
        .context("container arguments payload did not parse")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_base64_container_arguments() {
        let raw = serde_json::json!({
            "task_id": "ta-1",
            "function_id": "fu-1",
            "app_id": "ap-1",
            "function_def": {
                "module_name": "pkg.mod",
                "function_name": "run"
            }
        });
        let encoded = STANDARD.encode(serde_json::to_vec(&raw).unwrap());
        let args =
            parse_container_args(std::iter::once(encoded)).unwrap();
        assert_eq!(args.task_id, "ta-1");
        assert_eq!(args.function_def.module_name, "pkg.mod");
    }

    #[test]
    fn rejects_malformed_base64() {
        let err = parse_container_args(std::iter::once(
            "not-base64!!".to_string(),
        ));
        assert!(err.is_err());
    }

    #[test]
    fn rejects_extra_arguments() {
        let args = vec!["AAAA".to_string(), "extra".to_string()];
        assert!(parse_container_args(args.into_iter()).is_err());
    }
}

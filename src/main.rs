//! Patch Validator CLI
//!
//! Runs one validation session and prints the combined report as JSON.

use std::path::Path;

use patch_validator::{
    BackendKind, ContainerProvider, LocalVenvProvider, SandboxProvider, Session, SessionConfig,
    SessionFailure, SessionReport, SessionRequest, Validate,
};

const CONFIG_ENV: &str = "PATCH_VALIDATOR_CONFIG";

#[tokio::main]
async fn main() {
    // Logs go to stderr so stdout carries only the report
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 || args.len() > 4 {
        eprintln!("Usage: {} <codebase> <code.patch> [test.patch]", args[0]);
        eprintln!("\nRuns the codebase's tests before and after applying the patches.");
        eprintln!("\nEnvironment variables:");
        eprintln!("  {}=<file.yaml|file.toml>  Session configuration", CONFIG_ENV);
        std::process::exit(1);
    }

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let request = match build_request(&args[1], &args[2], args.get(3), &config) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("Failed to read inputs: {}", e);
            std::process::exit(1);
        }
    };

    let result = match config.backend {
        BackendKind::Container => {
            let mut provider = ContainerProvider::new(config.image());
            if let Some(cli) = &config.container_cli {
                provider = provider.with_cli(cli);
            }
            if let Some(name) = &config.sandbox_name {
                provider = provider.with_fixed_identity(name);
            }
            validate(provider, &config, &request).await
        }
        BackendKind::Local => {
            let mut provider = LocalVenvProvider::new(config.sandbox_root.clone());
            if let Some(name) = &config.sandbox_name {
                provider = provider.with_fixed_identity(name);
            }
            validate(provider, &config, &request).await
        }
    };

    match result {
        Ok(report) => match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Failed to serialize report: {}", e);
                std::process::exit(1);
            }
        },
        Err(failure) => {
            eprintln!("Validation failed: {}", failure);
            std::process::exit(1);
        }
    }
}

fn load_config() -> patch_validator::Result<SessionConfig> {
    let config = match std::env::var(CONFIG_ENV) {
        Ok(path) => SessionConfig::load(path)?,
        Err(_) => SessionConfig::default(),
    };
    for warning in config.validate().into_result()? {
        tracing::warn!("{}", warning);
    }
    Ok(config)
}

fn build_request(
    codebase: &str,
    code_patch: &str,
    test_patch: Option<&String>,
    config: &SessionConfig,
) -> std::io::Result<SessionRequest> {
    let mut request = SessionRequest::new(Path::new(codebase), std::fs::read_to_string(code_patch)?)
        .with_setup(config.setup.clone());
    if let Some(path) = test_patch {
        request = request.with_test_patch(std::fs::read_to_string(path)?);
    }
    Ok(request)
}

async fn validate<P: SandboxProvider + 'static>(
    provider: P,
    config: &SessionConfig,
    request: &SessionRequest,
) -> Result<SessionReport, SessionFailure> {
    let mut session = Session::from_config(provider, config);
    let result = session.run(request).await;
    tracing::info!(history = ?session.history(), "session finished");
    result
}

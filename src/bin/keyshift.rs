use std::process::ExitCode;

use keyshift::{cli, config, telemetry};

fn main() -> ExitCode {
    let cli = cli::parse_from(std::env::args_os());

    let cfg = match config::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(err) if cli.config.is_some() => {
            eprintln!("error: {err}");
            return ExitCode::from(2);
        }
        Err(err) => {
            eprintln!("config load failed, using defaults: {err}");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };
    let _telemetry_guard =
        telemetry::init(telemetry::TelemetryConfig::new(cli.verbose, cfg.logging.clone()));

    match cli::run(cli, cfg) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(
                transience = ?e.transience(),
                effect = e.effect().as_str(),
                "error: {e}"
            );
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

use std::{error::Error, path::Path};

use tracing::debug;

use daemonhost::{
    cli::{Cli, Commands, parse_args},
    config::{HostSettings, load_settings, parse_duration},
    environment::{HostBuilder, HostEnvironment},
    logs,
    notify::{NotifyState, SystemdNotifier},
    service::CommandService,
};

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    init_logging(&args);

    match args.command {
        Commands::Run {
            config,
            service_name,
            stop_timeout,
            no_force_exit,
            command,
        } => {
            let Some((program, program_args)) = command.split_first() else {
                return Err("no command given to run".into());
            };

            let mut settings = match config {
                Some(path) => load_settings(&path)?,
                None => HostSettings::new(default_service_name(program)),
            };
            if let Some(name) = service_name {
                settings.display_name = name.clone();
                settings.service_name = name;
            }
            if let Some(raw) = stop_timeout {
                settings.stop_timeout = parse_duration(&raw)?;
            }
            if no_force_exit {
                settings.force_exit_on_stop_timeout = false;
            }

            let service = CommandService::new(program.clone(), program_args.to_vec());
            let builder = HostBuilder::new(settings, service).use_linux_if_available()?;
            if let Some(command_line) = builder.command_line() {
                debug!("Command line: {command_line}");
            }

            // The host has already flushed and silenced logging by the time run returns.
            let exit_code = builder.build()?.run();
            std::process::exit(exit_code.code());
        }
        Commands::Probe => print_probe()?,
        Commands::Notify { state } => send_notification(&state)?,
    }

    Ok(())
}

fn init_logging(args: &Cli) {
    let level = args.log_level.map(|level| level.as_str());
    logs::init(logs::filter_for(level));
}

fn default_service_name(program: &str) -> String {
    Path::new(program)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string())
}

fn print_probe() -> Result<(), Box<dyn Error>> {
    let env = HostEnvironment::detect()?;
    let facts = env.facts();

    println!("windows: {}", facts.is_windows());
    println!("unix: {}", facts.is_unix());
    println!("linux: {}", facts.is_linux());
    println!("macos: {}", facts.is_macos());
    println!("64bit: {}", facts.is_64bit());
    println!("service_wrapper: {}", facts.is_under_service_wrapper());
    println!("systemd_unit: {}", facts.is_systemd_unit());
    println!("administrator: {}", env.is_administrator());
    println!("command_line: {}", env.command_line());
    Ok(())
}

fn send_notification(state: &NotifyState) -> Result<(), Box<dyn Error>> {
    let notifier = SystemdNotifier::from_env();
    if !notifier.is_enabled() {
        return Err("NOTIFY_SOCKET is not set; no service manager to notify".into());
    }

    notifier.try_notify(state)?;
    debug!("Sent {state}");
    Ok(())
}

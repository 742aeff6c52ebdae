use std::{env, panic, process};

use clap::Parser;

use vibetree::cli::{resolve_project_dir, Options};
use vibetree::logging;

fn main() {
    panic::set_hook(Box::new(|panic_info| {
        let message = match panic_info.payload().downcast_ref::<&str>() {
            Some(&message) => message.to_string(),
            None => match panic_info.payload().downcast_ref::<String>() {
                Some(message) => message.clone(),
                None => "<no message>".to_string(),
            },
        };

        log::error!(
            "vibetree crashed! You are running vibetree {}.",
            env!("CARGO_PKG_VERSION")
        );
        log::error!("This is probably a vibetree bug.");
        log::error!("");
        log::error!("Details: {}", message);

        if let Some(location) = panic_info.location() {
            log::error!("in file {} on line {}", location.file(), location.line());
        }

        process::exit(1);
    }));

    let options = Options::parse();

    let project_dir = resolve_project_dir(options.subcommand.project_path());

    let file_log_level = if env::var("VIBETREE_NO_FILE_LOG").is_ok() {
        None
    } else {
        logging::quick_read_file_log_level(&project_dir)
            .unwrap_or(Some(tracing::level_filters::LevelFilter::TRACE))
    };

    let command_name = format!("vibetree-{}", options.subcommand.command_name());

    let _log_guard = logging::init_logging(
        options.global.verbosity,
        options.global.color,
        Some(&project_dir),
        file_log_level,
        &command_name,
    );

    if let Err(err) = options.run() {
        log::error!("{:?}", err);
        process::exit(1);
    }
}

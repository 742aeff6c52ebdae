//! Defines VibeTree's CLI through clap types.

mod serve;

use std::{
    borrow::Cow,
    env,
    path::{Path, PathBuf},
    str::FromStr,
};

use clap::Parser;
use thiserror::Error;

pub use self::serve::ServeCommand;

/// Command line options that VibeTree accepts, defined using the clap crate.
#[derive(Debug, Parser)]
#[clap(name = "vibetree", version, about)]
pub struct Options {
    #[clap(flatten)]
    pub global: GlobalOptions,

    /// Subcommand to run in this invocation.
    #[clap(subcommand)]
    pub subcommand: Subcommand,
}

impl Options {
    pub fn run(self) -> anyhow::Result<()> {
        match self.subcommand {
            Subcommand::Serve(subcommand) => subcommand.run(),
            Subcommand::Completions(subcommand) => subcommand.run(),
        }
    }
}

#[derive(Debug, Parser)]
pub struct GlobalOptions {
    /// Sets verbosity level. Can be specified multiple times.
    #[clap(long("verbose"), short, global(true), action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Set color behavior. Valid values are auto, always, and never.
    #[clap(long("color"), global(true), default_value("auto"))]
    pub color: ColorChoice,
}

#[derive(Debug, Clone, Copy)]
pub enum ColorChoice {
    Auto,
    Always,
    Never,
}

impl FromStr for ColorChoice {
    type Err = ColorChoiceParseError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        match source {
            "auto" => Ok(ColorChoice::Auto),
            "always" => Ok(ColorChoice::Always),
            "never" => Ok(ColorChoice::Never),
            _ => Err(ColorChoiceParseError {
                attempted: source.to_owned(),
            }),
        }
    }
}

#[derive(Debug, Error)]
#[error("Invalid color choice '{attempted}'. Valid values are: auto, always, never")]
pub struct ColorChoiceParseError {
    attempted: String,
}

#[derive(Debug, Parser)]
pub enum Subcommand {
    /// Starts the coordination server, serving the HTTP/WS API over the
    /// repos it's asked to track.
    Serve(ServeCommand),

    /// Generates shell completion scripts.
    Completions(CompletionsCommand),
}

impl Subcommand {
    pub fn project_path(&self) -> Option<&Path> {
        match self {
            Subcommand::Serve(cmd) => cmd.project.as_deref(),
            Subcommand::Completions(_) => None,
        }
    }

    pub fn command_name(&self) -> &'static str {
        match self {
            Subcommand::Serve(_) => "serve",
            Subcommand::Completions(_) => "completions",
        }
    }
}

#[derive(Debug, Parser)]
pub struct CompletionsCommand {
    /// Which shell to generate a completion script for.
    pub shell: clap_complete::Shell,
}

impl CompletionsCommand {
    pub fn run(self) -> anyhow::Result<()> {
        use clap::CommandFactory;

        let mut command = Options::command();
        let name = command.get_name().to_owned();
        clap_complete::generate(self.shell, &mut command, name, &mut std::io::stdout());
        Ok(())
    }
}

pub fn resolve_path(path: &Path) -> Cow<'_, Path> {
    if path.is_absolute() {
        Cow::Borrowed(path)
    } else {
        Cow::Owned(env::current_dir().unwrap().join(path))
    }
}

/// Resolves a project path (which may be absent, meaning the current
/// directory) to the directory VibeTree should treat as the repo root.
pub fn resolve_project_dir(project_path: Option<&Path>) -> PathBuf {
    match project_path {
        Some(path) => resolve_path(path).into_owned(),
        None => env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    }
}

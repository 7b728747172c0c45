use std::path::PathBuf;

use clap::{ColorChoice, Parser};

#[derive(Parser, Debug, Clone)]
pub struct Options {
    /// Log everything, including span enter and exit events
    #[arg(short, long, global = true, default_value = "false")]
    pub verbose: bool,

    #[arg(long, global = true, default_value_t = ColorChoice::Auto)]
    pub color: ColorChoice,

    /// The deployment document
    #[arg(short = 'f', long, global = true, default_value = "fleetform.json")]
    pub file: PathBuf,

    /// The state file. Created when missing.
    #[arg(long, global = true, default_value = "fleetform-state.json")]
    pub state: PathBuf,

    /// Base URL of the control plane
    #[arg(long, global = true, default_value = fleetform_remote_http::DEFAULT_ENDPOINT)]
    pub endpoint: String,

    /// Bearer token for the control plane
    #[arg(long, global = true, env = "FLEETFORM_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Work against an empty in-memory control plane, without recording state
    #[arg(long, global = true, default_value_t = false)]
    pub simulate: bool,
}

impl Options {
    pub fn color_enabled(&self) -> bool {
        use std::io::IsTerminal as _;
        match self.color {
            ColorChoice::Always => true,
            ColorChoice::Never => false,
            ColorChoice::Auto => std::io::stderr().is_terminal(),
        }
    }
}

mod application;
mod apply;
mod config;
mod control;
mod import;
mod interrupt;
mod logging;
mod options;
mod plan;
mod state;
mod work;

use anyhow::Result;
use application::{handle_result, runtime};
use clap::{CommandFactory as _, Parser, Subcommand};
use interrupt::{set_up_process_interrupt_handler, InterruptState};
use options::Options;

fn main() {
    let args = Args::parse();
    handle_result(run_args(args));
}

fn run_args(args: Args) -> Result<()> {
    match &args.command {
        Commands::GenerateMan => {
            let cmd = Args::command();
            let man = clap_mangen::Man::new(cmd);
            let mut buffer: Vec<u8> = Default::default();
            man.render(&mut buffer)?;
            println!("{}", String::from_utf8(buffer)?);
            Ok(())
        }
        Commands::GenerateMarkdown => {
            let opts = clap_markdown::MarkdownOptions::new().show_footer(false);
            let markdown: String = clap_markdown::help_markdown_custom::<Args>(&opts);
            println!("{}", markdown);
            Ok(())
        }
        Commands::GenerateCompletion { shell } => {
            let mut cmd = Args::command();
            clap_complete::generate(*shell, &mut cmd, "fleetform", &mut std::io::stdout());
            Ok(())
        }
        command => {
            let mut logging = logging::set_up(logging::Options {
                verbose: args.options.verbose,
                color: args.options.color_enabled(),
            })?;
            let interrupt_state = set_up_process_interrupt_handler()?;
            let result =
                runtime()?.block_on(run_command(&interrupt_state, &args.options, command));
            logging.tear_down()?;
            result
        }
    }
}

async fn run_command(
    interrupt_state: &InterruptState,
    options: &Options,
    command: &Commands,
) -> Result<()> {
    match command {
        Commands::Plan(subargs) => plan::plan(interrupt_state, options, subargs).await,
        Commands::Apply(subargs) => apply::apply(interrupt_state, options, subargs).await,
        Commands::Refresh(subargs) => plan::refresh(interrupt_state, options, subargs).await,
        Commands::Destroy(subargs) => apply::destroy(interrupt_state, options, subargs).await,
        Commands::Import(subargs) => import::import(interrupt_state, options, subargs).await,
        Commands::Exists(subargs) => import::exists(interrupt_state, options, subargs).await,
        Commands::GenerateMan | Commands::GenerateMarkdown | Commands::GenerateCompletion { .. } => {
            Ok(())
        }
    }
}

/// fleetform: reconcile Kubernetes clusters, node pools, compute fleets and
/// container registries with a declarative deployment document
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    options: Options,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show what apply would change
    Plan(plan::Args),

    /// Create or update resources so that they match the deployment
    Apply(apply::Args),

    /// Read resources and record what the control plane reports
    Refresh(plan::RefreshArgs),

    /// Delete resources, children before parents
    Destroy(apply::DestroyArgs),

    /// Print an existing resource as a deployment document entry
    Import(import::Args),

    /// Check whether a resource exists; exit status 2 if it does not
    Exists(import::ExistsArgs),

    /// Generate markdown documentation for fleetform
    #[command(hide = true)]
    GenerateMarkdown,

    /// Generate a manpage for fleetform
    #[command(hide = true)]
    GenerateMan,

    /// Generate shell completion for fleetform
    #[command(hide = true)]
    GenerateCompletion {
        /// The shell to generate completion for
        #[arg(long)]
        shell: clap_complete::Shell,
    },
}

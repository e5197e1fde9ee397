use cli::args::{CommandsEnum, HybridDdpArgs};
use cli::output::FilePrefix;
use cli::solve::{solve_problem, ProblemDefinition};

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: HybridDdpArgs = HybridDdpArgs::parse();

    let problem_definition = |path: &str| -> ProblemDefinition {
        serde_json::from_str(&std::fs::read_to_string(path).expect("Unable to read param file"))
            .expect("Unable to parse param file")
    };

    match &args.command {
        Some(CommandsEnum::Solve(params)) => {
            let file_prefix =
                FilePrefix::for_params(&params.params_path, "solve", params.date_time_out)
                    .expect("Unable to prepare the output directory");

            solve_problem(&problem_definition(&params.params_path), file_prefix)
                .expect("solve failed");
        }
        None => {
            println!("Default command (nothing specified!)");
        }
    }
}

use clap::Parser;
use esppart::cli::Cli;

fn main() {
    let cli = Cli::parse();
    if let Err(error) = esppart::cli::init_logger(&cli) {
        eprintln!("{error}");
        std::process::exit(error.exit_code());
    }

    if let Err(error) = esppart::cli::run(cli) {
        log::error!("{error}");
        std::process::exit(error.exit_code());
    }
}

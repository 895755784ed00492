use clap::Parser;
use mtastage::cli::commands;
use mtastage::cli::{log_level, output, Cli, Commands};
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};

fn main() {
    let cli = Cli::parse();

    let log_config = ConfigBuilder::new()
        .set_target_level(log::LevelFilter::Off)
        .set_thread_level(log::LevelFilter::Off)
        .build();
    if let Err(e) = TermLogger::init(
        log_level(&cli),
        log_config,
        TerminalMode::Stderr,
        ColorChoice::Auto,
    ) {
        output::warning(&format!("logging unavailable: {e}"));
    }

    let result = match cli.command {
        Commands::Current => commands::current::execute(&cli),
        Commands::Stage {
            ref assignments,
            ref unset,
        } => commands::stage::execute(&cli, assignments, unset),
        Commands::Diff => commands::diff::execute(&cli),
        Commands::Discard { force } => commands::discard::execute(&cli, force),
        Commands::Validate { ref assignments } => commands::validate::execute(&cli, assignments),
        Commands::Apply => commands::apply::execute(&cli),
        Commands::Rollback { version } => commands::rollback::execute(&cli, version),
        Commands::History { limit } => commands::history::execute(&cli, limit),
        Commands::Show { version } => commands::history::execute_show(&cli, version),
        Commands::Credential { ref user } => commands::credential::execute(&cli, user),
        Commands::RotateSecret => commands::rotate::execute(&cli),
        Commands::Audit { last, ref since } => {
            commands::audit_cmd::execute(&cli, last, since.as_deref())
        }
    };

    if let Err(e) = result {
        output::error(&e.to_string());
        if e.is_transient() {
            output::tip("Another apply or rollback holds the lock; try again shortly.");
        }
        // Compensation failures need an operator; give scripts a distinct code.
        std::process::exit(if e.is_fatal() { 3 } else { 1 });
    }
}

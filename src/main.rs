use std::process;

use querysync::{
    config::{self, Command, PurgeArgs, SessionArgs, Settings},
    infra::{
        error::InfraError,
        persist::{Persistor, RehydrateOutcome},
        telemetry,
    },
};
use serde::Serialize;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| InfraError::configuration(format!("failed to load configuration: {err}")))?;

    let command = cli_args.command.unwrap_or_default();

    telemetry::init(&settings.logging)?;

    match command {
        Command::Session(args) => run_session(&settings, &args).await,
        Command::Purge(args) => run_purge(&settings, &args).await,
    }
}

#[derive(Serialize)]
struct SessionReport<'a> {
    storage_key: &'a str,
    version: u32,
    user_id: Option<String>,
    has_token: bool,
    outcome: RehydrateOutcome,
}

async fn run_session(settings: &Settings, args: &SessionArgs) -> Result<(), InfraError> {
    let persistor = Persistor::from_settings(&settings.persistence);
    let rehydration = persistor.rehydrate().await;

    let report = SessionReport {
        storage_key: persistor.storage_key(),
        version: persistor.version(),
        user_id: rehydration.auth.user.as_ref().map(|user| user.id.clone()),
        has_token: rehydration.auth.access_token.is_some(),
        outcome: rehydration.outcome,
    };

    let output = if args.pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{output}");
    Ok(())
}

async fn run_purge(settings: &Settings, _args: &PurgeArgs) -> Result<(), InfraError> {
    let persistor = Persistor::from_settings(&settings.persistence);
    persistor.purge().await?;
    info!(
        key = persistor.storage_key(),
        directory = %settings.persistence.directory.display(),
        "Persisted record purged"
    );
    Ok(())
}

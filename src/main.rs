use std::{env, process::exit};

use args::{ArgumentsRequest, StartupArguments};
use snova::{client::Client, config::Config, server::Server, transport::TransportTable, Error};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

mod args;

fn main() {
    let arguments = match args::parse_arguments(env::args()) {
        Err(err) => {
            eprintln!("{err}\n\nType 'snova --help' for a help menu");
            exit(1);
        }
        Ok(arguments) => arguments,
    };

    let startup_args = match arguments {
        ArgumentsRequest::Version => {
            println!("{}", args::get_version_string());
            return;
        }
        ArgumentsRequest::Help => {
            println!("{}", args::get_help_string());
            return;
        }
        ArgumentsRequest::Run(startup_args) => startup_args,
    };

    let config = match Config::load(&startup_args.config_path) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("{error}");
            exit(1);
        }
    };

    let level = match (startup_args.verbose, startup_args.silent) {
        (true, _) => Level::DEBUG,
        (_, true) => Level::ERROR,
        _ => config.log_level.parse().unwrap_or(Level::INFO),
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).with_target(false).finish();
    if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set up logging: {error}");
    }

    let runtime_result = tokio::runtime::Builder::new_multi_thread().enable_all().build();

    let result = match runtime_result {
        Ok(runtime) => runtime.block_on(async_main(startup_args, config)),
        Err(err) => {
            eprintln!("Failed to start Tokio runtime: {err}");
            exit(1);
        }
    };

    if let Err(error) = result {
        error!("Program finished with error: {error}");
        exit(1);
    }
}

async fn async_main(startup_args: StartupArguments, config: Config) -> Result<(), Error> {
    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();

    match (&config.server, startup_args.mode.runs_server()) {
        (Some(server_config), true) => {
            let server = Server::bind(server_config).await?;
            info!("Server listening on {:?}", server.local_addrs());
            let token = shutdown.child_token();
            tasks.push(tokio::spawn(async move {
                server.run(token).await;
                Ok::<(), Error>(())
            }));
        }
        (None, true) if startup_args.mode != args::StartupMode::Both => {
            return Err(Error::Config("the configuration has no server section".to_string()));
        }
        _ => {}
    }

    match (&config.client, startup_args.mode.runs_client()) {
        (Some(client_config), true) => {
            let client = Client::new(client_config.clone(), TransportTable::with_defaults(), None);
            tasks.push(tokio::spawn(client.run(shutdown.child_token())));
        }
        (None, true) if startup_args.mode != args::StartupMode::Both => {
            return Err(Error::Config("the configuration has no client section".to_string()));
        }
        _ => {}
    }

    if tasks.is_empty() {
        return Err(Error::Config("nothing to run, the configuration has neither a client nor a server section".to_string()));
    }

    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {error}");
    }

    info!("Shutting down");
    shutdown.cancel();
    for task in tasks {
        match task.await {
            Ok(result) => result?,
            Err(error) => warn!("Task failed: {error}"),
        }
    }

    Ok(())
}

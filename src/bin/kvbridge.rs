use std::{path::PathBuf, time::Duration};

use anyhow::{Error, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::Receiver;
use kvbridge::{
    BridgeConfig, Event, Server, SledDriver,
    protocol::{ExecuteRequest, LoadContentRequest, Reply, RequestId},
};

#[derive(Parser, Debug)]
#[command(author, version)]
struct Cli {
    /// sled directory to open
    #[arg(short, long, default_value = "./")]
    path: PathBuf,
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Print every event as a JSON line
    #[arg(long)]
    events: bool,
    /// Seconds to wait for each operation
    #[arg(long, default_value_t = 10)]
    timeout: u64,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List databases
    Databases,
    /// List keys of a database
    Keys {
        #[arg(short, long, default_value = "db0")]
        db: String,
        #[arg(long, default_value = "*")]
        pattern: String,
        #[arg(long, default_value_t = 100)]
        count: u64,
    },
    /// Run a command
    Exec {
        #[arg(required = true)]
        text: Vec<String>,
    },
    /// Show server info
    Info,
    /// Dump all databases to a JSON file
    Backup { file: PathBuf },
    /// Load a JSON dump
    Restore { file: PathBuf },
}

struct Session {
    server: Server<SledDriver>,
    events: Receiver<Event>,
    timeout: Duration,
    print_events: bool,
}

impl Session {
    /// Wait for `id` and return its reply, printing events on the way.
    fn finish(&mut self, id: RequestId) -> Result<Reply> {
        if !self.server.wait_for(id, self.timeout) {
            return Err(Error::msg(format!("timed out waiting for request {}", id.0)));
        }
        let mut outcome = None;
        for event in self.events.try_iter() {
            if self.print_events {
                println!("{}", serde_json::to_string(&event)?);
            }
            if let Event::Finished {
                id: finished,
                result,
                ..
            } = event
            {
                if finished == id {
                    outcome = Some(result);
                }
            }
        }
        match outcome {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(e)) => Err(Error::msg(e.to_string())),
            None => Err(Error::msg(format!("request {} produced no result", id.0))),
        }
    }

    fn drain(&mut self) -> Result<()> {
        for event in self.events.try_iter() {
            if self.print_events {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => BridgeConfig::from_file(path)?,
        None => BridgeConfig::default(),
    };
    let server = Server::new(SledDriver::open(&cli.path)?, config)?;
    let events = server.events();
    let mut session = Session {
        server,
        events,
        timeout: Duration::from_secs(cli.timeout),
        print_events: cli.events,
    };

    let id = session.server.connect();
    session.finish(id)?;
    // discovery follows the connect
    if !session.server.wait_idle(session.timeout) {
        return Err(Error::msg("timed out during discovery"));
    }
    session.drain()?;

    let id = match cli.command {
        Commands::Databases => session.server.load_databases(),
        Commands::Keys { db, pattern, count } => {
            let mut req = LoadContentRequest::new(db, count);
            req.pattern = pattern;
            session.server.load_database_content(req)
        }
        Commands::Exec { text } => session.server.execute(ExecuteRequest::new(text.join(" "))),
        Commands::Info => session.server.load_server_info(),
        Commands::Backup { file } => session.server.backup(file),
        Commands::Restore { file } => session.server.export(file),
    };
    let reply = session.finish(id);

    let id = session.server.disconnect();
    session.finish(id)?;

    match reply? {
        Reply::Databases(databases) => {
            for db in databases {
                let marker = if db.is_current() { "*" } else { " " };
                println!("{marker} {}\t{}", db.name(), db.key_count());
            }
        }
        Reply::DatabaseContent(content) => {
            for key in content.keys {
                println!(
                    "{}\t{}\t{}",
                    key.key.name,
                    key.key.ttl,
                    key.value.unwrap_or_default()
                );
            }
        }
        Reply::Executed(output) => {
            for line in output.lines {
                println!("{line}");
            }
        }
        Reply::ServerInfo(info) => print!("{info}"),
        Reply::BackedUp(path) | Reply::Exported(path) => println!("{}", path.display()),
        other => println!("{}", serde_json::to_string(&other)?),
    }
    Ok(())
}

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use qcache::cache::{CacheStorage, NoopStorage, QueryClient, SqliteStorage};
use qcache::config::{Config, EnvironmentMode};
use qcache::rpc::{Method, RpcClient};
use qcache::serializer::{self, Payload};

#[derive(Parser, Debug)]
#[command(name = "qcache")]
#[command(about = "Cached, retrying client for typed RPC endpoints")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/qcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Operating mode (default: from config, QCACHE_ENV or NODE_ENV)
  #[arg(short, long, value_enum)]
  mode: Option<EnvironmentMode>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Call a query procedure, serving fresh cached data when present
  Query {
    /// Dotted procedure path, e.g. user.profile
    procedure: String,
    /// Input as JSON
    #[arg(short, long)]
    input: Option<String>,
    /// Send as GET with the input in the query string
    #[arg(long)]
    get: bool,
    /// Ignore fresh cached data
    #[arg(long)]
    refetch: bool,
  },
  /// Call a mutation procedure
  Mutate {
    procedure: String,
    #[arg(short, long)]
    input: Option<String>,
    /// Query paths to mark stale afterwards
    #[arg(long)]
    invalidate: Vec<String>,
  },
  /// List cached queries
  Inspect,
  /// Drop the persisted cache
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging()?;

  let config = Config::load(args.config.as_deref())?;
  let mode = config.resolve_mode(args.mode);
  info!(?mode, "starting");

  let storage: Box<dyn CacheStorage> = if config.cache.persist {
    Box::new(SqliteStorage::open(config.cache.path.as_deref())?)
  } else {
    Box::new(NoopStorage)
  };

  let cache = QueryClient::new(mode);
  match cache.hydrate(storage.load_state()?) {
    Ok(count) => info!(count, "restored cached queries"),
    Err(e) => warn!(error = %e, "discarding unreadable cache snapshot"),
  }

  match args.command {
    Command::Query {
      procedure,
      input,
      get,
      refetch,
    } => {
      let rpc = RpcClient::from_config(&config, cache.clone())?;
      let path = split_procedure(&procedure);
      let input = parse_input(input.as_deref())?;
      let method = if get { Method::Get } else { Method::Post };
      let result = if refetch {
        rpc.refetch(path, input, method).await?
      } else {
        rpc.query(path, input, method).await?
      };
      eprintln!("source: {:?}", result.source);
      print_payload(&result.data)?;
    }
    Command::Mutate {
      procedure,
      input,
      invalidate,
    } => {
      let rpc = RpcClient::from_config(&config, cache.clone())?;
      let input = parse_input(input.as_deref())?;
      let data = rpc.mutate(split_procedure(&procedure), input).await?;
      for prefix in &invalidate {
        let count = rpc.invalidate(split_procedure(prefix));
        info!(prefix = %prefix, count, "invalidated after mutation");
      }
      print_payload(&data)?;
    }
    Command::Inspect => {
      let state = cache.dehydrate();
      if state.is_empty() {
        println!("cache is empty");
      }
      for query in &state.queries {
        let updated = query
          .state
          .data_updated_at
          .map(|at| at.to_rfc3339())
          .unwrap_or_else(|| "-".to_string());
        println!(
          "{}  {:<7}  {}  {}",
          &query.query_hash[..12],
          query.state.status.as_str(),
          updated,
          query.query_key.json
        );
      }
      return Ok(());
    }
    Command::Clear => {
      cache.clear();
      storage.clear()?;
      println!("cache cleared");
      return Ok(());
    }
  }

  storage.store_state(&cache.dehydrate())?;
  Ok(())
}

/// Log to a daily file under the data directory; stdout carries results.
fn init_logging() -> Result<WorkerGuard> {
  let log_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("qcache")
    .join("logs");

  let appender = tracing_appender::rolling::daily(log_dir, "qcache.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("qcache=info")),
    )
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

fn split_procedure(procedure: &str) -> Vec<String> {
  procedure
    .split('.')
    .filter(|s| !s.is_empty())
    .map(String::from)
    .collect()
}

fn parse_input(input: Option<&str>) -> Result<Option<Payload>> {
  input
    .map(|raw| {
      serde_json::from_str::<serde_json::Value>(raw)
        .map(Payload::from)
        .map_err(|e| eyre!("Invalid JSON input: {}", e))
    })
    .transpose()
}

fn print_payload(payload: &Payload) -> Result<()> {
  let envelope = serializer::serialize(payload);
  let text = serde_json::to_string_pretty(&envelope.to_value())
    .map_err(|e| eyre!("Failed to format result: {}", e))?;
  println!("{}", text);
  Ok(())
}

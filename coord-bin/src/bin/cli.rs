use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use coord_lib::{
    shutdown, ConnectionPool, Frame, PoolConfig, PubSubHandler, DEFAULT_PORT, HEALTH_CHECK_PERIOD,
};
use std::num::ParseIntError;
use std::str;
use std::time::Duration;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

type Error = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(name = "coord-cli", version, author, about = "Exercise the coordination primitives")]
struct CliCommand {
    #[clap(subcommand)]
    sub_cmd: Command,

    #[clap(flatten)]
    store: StoreArgs,
}

/// Connection settings, each also readable from a `COORD_*` variable.
#[derive(Args, Debug)]
struct StoreArgs {
    #[arg(long, env = "COORD_HOST", default_value = "localhost")]
    host: String,

    #[arg(long, env = "COORD_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long, env = "COORD_DATABASE", default_value_t = 0)]
    database: u32,

    #[arg(long, env = "COORD_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "COORD_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[arg(long, env = "COORD_AUTH_CODE", hide_env_values = true)]
    auth_code: Option<String>,

    #[arg(long, env = "COORD_USE_TLS")]
    use_tls: bool,

    #[arg(long, env = "COORD_TLS_INSECURE")]
    tls_insecure: bool,

    #[arg(long, env = "COORD_MAX_IDLE", default_value_t = 8)]
    max_idle: usize,

    /// 0 means unbounded.
    #[arg(long, env = "COORD_MAX_ACTIVE", default_value_t = 32)]
    max_active: usize,

    /// Seconds.
    #[arg(long, env = "COORD_IDLE_TIMEOUT", value_parser = duration_from_secs, default_value = "240")]
    idle_timeout: Duration,
}

impl StoreArgs {
    fn into_config(self) -> PoolConfig {
        PoolConfig {
            host: self.host,
            port: self.port,
            database: self.database,
            username: self.username,
            password: self.password,
            auth_code: self.auth_code,
            use_tls: self.use_tls,
            tls_insecure: self.tls_insecure,
            max_idle: self.max_idle,
            max_active: self.max_active,
            idle_timeout: self.idle_timeout,
            ..PoolConfig::default()
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    Ping,
    Get {
        key: String,
    },
    Set {
        key: String,
        value: String,
        /// Expiry in seconds.
        #[clap(long, value_parser = duration_from_secs)]
        ttl: Option<Duration>,
    },
    Del {
        keys: Vec<String>,
    },
    Incr {
        key: String,
    },
    Ttl {
        key: String,
    },
    /// Stream every key matching a pattern.
    Scan {
        #[clap(default_value = "*")]
        pattern: String,
        #[clap(long, default_value_t = 100)]
        count: usize,
    },
    /// Take a lock, hold it, then release it.
    Lock {
        key: String,
        /// Lock time to live in milliseconds.
        #[clap(long, value_parser = duration_from_millis, default_value = "10000")]
        ttl: Duration,
        /// How long to hold the lock, in milliseconds.
        #[clap(long, value_parser = duration_from_millis, default_value = "1000")]
        hold: Duration,
        #[clap(long, default_value_t = 10)]
        retries: usize,
        /// Pause between attempts, in milliseconds.
        #[clap(long, value_parser = duration_from_millis, default_value = "200")]
        pause: Duration,
    },
    Publish {
        channel: String,
        message: Bytes,
    },
    /// Print messages until Ctrl-C.
    Subscribe {
        channels: Vec<String>,
    },
    MemoryStats,
}

fn duration_from_secs(src: &str) -> Result<Duration, ParseIntError> {
    Ok(Duration::from_secs(src.parse::<u64>()?))
}

fn duration_from_millis(src: &str) -> Result<Duration, ParseIntError> {
    Ok(Duration::from_millis(src.parse::<u64>()?))
}

struct PrintMessages;

impl PubSubHandler for PrintMessages {
    fn on_subscribed(&self) -> Result<(), Error> {
        println!("subscribed; press Ctrl-C to stop");
        Ok(())
    }

    fn on_message(&self, channel: &str, payload: Bytes) {
        println!("{}: {}", channel, display(&payload));
    }

    fn on_health_check(&self, _data: &str) {
        tracing::debug!("pong");
    }
}

fn display(bytes: &[u8]) -> String {
    match str::from_utf8(bytes) {
        Ok(string) => format!("\"{}\"", string),
        Err(_) => format!("{:?}", bytes),
    }
}

/// `flavor = "current_thread"` keeps the CLI light; the subscription's
/// receive task shares the one thread with the control loop.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()?;

    let cli = CliCommand::parse();
    let pool = ConnectionPool::start(cli.store.into_config()).await?;

    match cli.sub_cmd {
        Command::Ping => {
            let mut conn = pool.get().await?;
            println!("{}", conn.ping().await?);
        }
        Command::Get { key } => {
            let mut conn = pool.get().await?;
            match conn.query::<Option<Bytes>>(&coord_lib::Command::new("GET").arg(&key)).await? {
                Some(value) => println!("{}", display(&value)),
                None => println!("(nil)"),
            }
        }
        Command::Set { key, value, ttl } => {
            let mut conn = pool.get().await?;
            let reply = match ttl {
                Some(ttl) => conn.set_string_ttl(&key, &value, ttl).await?,
                None => conn.set_string(&key, &value).await?,
            };
            println!("{}", reply);
        }
        Command::Del { keys } => {
            let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
            let mut conn = pool.get().await?;
            println!("(integer) {}", conn.del(&keys).await?);
        }
        Command::Incr { key } => {
            let mut conn = pool.get().await?;
            println!("(integer) {}", conn.increment_by(&key, 1).await?);
        }
        Command::Ttl { key } => {
            let mut conn = pool.get().await?;
            println!("(integer) {}", conn.ttl(&key).await?);
        }
        Command::Scan { pattern, count } => {
            let (_signal, shutdown) = shutdown::channel();
            let keys = pool.scan(&pattern, count, shutdown).await?.into_stream();
            tokio::pin!(keys);

            while let Some(key) = keys.next().await {
                println!("{}", key?);
            }
        }
        Command::Lock {
            key,
            ttl,
            hold,
            retries,
            pause,
        } => {
            let (_signal, mut shutdown) = shutdown::channel();
            let mut conn = pool.get().await?;
            match conn
                .acquire_lock_with_retries(&mut shutdown, &key, ttl, retries, pause)
                .await
            {
                Some(lock) => {
                    println!("acquired {} ({})", lock.key(), lock.token());
                    tokio::time::sleep(hold).await;
                    lock.release(&mut conn).await?;
                    println!("released");
                }
                None => println!("not acquired"),
            }
        }
        Command::Publish { channel, message } => {
            let mut publisher = pool.publisher().await?;
            let receivers = publisher.publish(&channel, message).await?;
            println!("(integer) {}", receivers);
        }
        Command::Subscribe { channels } => {
            if channels.is_empty() {
                return Err("channel(s) must be provided".into());
            }

            let (signal, shutdown) = shutdown::channel();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    signal.trigger();
                }
            });

            tracing::debug!(period = ?HEALTH_CHECK_PERIOD, "pinging subscription");
            pool.listen_pubsub_channels(PrintMessages, shutdown, &channels)
                .await?;
        }
        Command::MemoryStats => {
            let mut conn = pool.get().await?;
            let mut stats: Vec<(String, Frame)> = conn.memory_stats().await?.into_iter().collect();
            stats.sort_by(|a, b| a.0.cmp(&b.0));
            for (name, value) in stats {
                println!("{}: {}", name, value);
            }
        }
    }

    pool.stop();
    Ok(())
}

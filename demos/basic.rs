/// RESUME_LSN="0/16B6C50" STOP_LSN="0/17000000" cargo run --example basic
use pg_replicant::{ConnectionConfig, Lsn, ReplicationClient, ReplicationConfig, ReplicationEvent};

fn env(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_lsn(name: &str) -> anyhow::Result<Option<Lsn>> {
    match std::env::var(name) {
        Ok(s) => Ok(Some(Lsn::parse(&s)?)),
        Err(_) => Ok(None),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pg_replicant=debug".into()),
        )
        .init();

    let cfg = ReplicationConfig {
        connection: ConnectionConfig {
            host: env("PGHOST", "127.0.0.1"),
            port: env("PGPORT", "5432").parse()?,
            user: env("PGUSER", "postgres"),
            ..ConnectionConfig::default()
        },
        // None: start wherever IDENTIFY_SYSTEM says the server is
        resume_from: env_lsn("RESUME_LSN")?,
        stop_at: env_lsn("STOP_LSN")?,
        ..ReplicationConfig::default()
    };

    let mut repl = ReplicationClient::connect(cfg).await?;

    loop {
        match repl.recv().await? {
            ReplicationEvent::Started { system, cursor } => {
                println!(
                    "Started system={} cursor={cursor}",
                    system.system_id.as_deref().unwrap_or("?")
                );
            }
            ReplicationEvent::XLogData(x) => {
                println!("XLogData start={} end={} bytes={}", x.start, x.end, x.records.len());
            }
            ReplicationEvent::Keepalive(k) => {
                println!("Keepalive end={} ping={}", k.end, k.ping);
            }
            ReplicationEvent::StoppedAt { reached } => {
                println!("StoppedAt reached={reached}");
                break;
            }
            other => println!("{other:?}"),
        }
    }

    if let Some(cursor) = repl.cursor() {
        println!("resume next time from {}", cursor.position);
    }
    repl.join().await?;
    Ok(())
}

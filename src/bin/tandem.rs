//! tandem CLI: operator interface to locks, queues and channels.

use std::time::Duration;

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use tandem_rs::config::Config;
use tandem_rs::telemetry::{TelemetryConfig, init_telemetry};
use tandem_rs::{Coordinator, Error, RequestId};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "tandem", about = "Distributed locks and request/response channels")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer requests on a channel until interrupted
    Serve {
        /// Channel name
        channel: String,
        /// Seconds to wait for each request before polling again
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
    /// Send one request and wait for its response
    Send {
        /// Channel name
        channel: String,
        /// Request payload
        payload: String,
        /// Seconds to wait for the response (0 waits forever)
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
    /// Hold a lock for a while
    Lock {
        /// Lock name
        name: String,
        /// Lease in seconds
        #[arg(long, default_value_t = 30)]
        lease: u64,
        /// Seconds to hold the lock before releasing
        #[arg(long, default_value_t = 5)]
        hold: u64,
        /// Seconds to wait for the lock (0 waits forever)
        #[arg(long, default_value_t = 10)]
        wait: u64,
    },
    /// Inspect a queue
    Queue {
        /// Queue base name
        name: String,
        /// Move every in-flight item back to the visible list
        #[arg(long)]
        requeue: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "tandem".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let coordinator = Coordinator::connect(config.redis_url.expose_secret())
        .await?
        .with_channel_config(config.channel_config());

    match cli.command {
        Command::Serve { channel, timeout } => cmd_serve(&coordinator, channel, timeout).await,
        Command::Send {
            channel,
            payload,
            timeout,
        } => cmd_send(&coordinator, channel, payload, timeout).await,
        Command::Lock {
            name,
            lease,
            hold,
            wait,
        } => cmd_lock(&coordinator, name, lease, hold, wait).await,
        Command::Queue { name, requeue } => cmd_queue(&coordinator, name, requeue).await,
    }
}

async fn cmd_serve(coordinator: &Coordinator, channel: String, timeout: u64) -> anyhow::Result<()> {
    let mut server = coordinator.server(&channel);
    info!(channel = %channel, "serving");

    loop {
        let next = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            next = server.block_recv_req(Some(Duration::from_secs(timeout))) => next,
        };

        let request = match next {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(Error::MissingPayload { request_id }) => {
                warn!(request_id = %request_id, "dropping request without payload");
                server.ack_req(&RequestId(request_id)).await?;
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let body = serde_json::json!({
            "data": String::from_utf8_lossy(&request.payload),
        });
        if server
            .send_rsp(&request.id, serde_json::to_vec(&body)?)
            .await?
        {
            server.ack_req(&request.id).await?;
        }
    }

    server.close().await;
    Ok(())
}

async fn cmd_send(
    coordinator: &Coordinator,
    channel: String,
    payload: String,
    timeout: u64,
) -> anyhow::Result<()> {
    let mut client = coordinator.client(&channel);
    let id = client.send_req(payload.as_bytes()).await?;
    println!("Sent:     {id}");

    match client
        .block_recv_rsp(&id, Some(Duration::from_secs(timeout)))
        .await?
    {
        Some(response) => {
            client.ack_rsp(&id, &response).await?;
            println!("Response: {}", String::from_utf8_lossy(&response));
        }
        None => println!("No response within {timeout}s"),
    }

    client.close().await;
    Ok(())
}

async fn cmd_lock(
    coordinator: &Coordinator,
    name: String,
    lease: u64,
    hold: u64,
    wait: u64,
) -> anyhow::Result<()> {
    let mut lock = coordinator.lock(&name);
    let held = lock
        .run(
            Duration::from_secs(lease),
            Some(Duration::from_secs(wait)),
            || async {
                println!("Holding {name} for {hold}s");
                tokio::time::sleep(Duration::from_secs(hold)).await;
            },
        )
        .await?;

    match held {
        Some(()) => println!("Released {name}"),
        None => println!("Could not acquire {name} within {wait}s"),
    }
    Ok(())
}

async fn cmd_queue(coordinator: &Coordinator, name: String, requeue: bool) -> anyhow::Result<()> {
    let queue = coordinator.queue(&name);

    if requeue {
        let mut moved = 0;
        for item in queue.in_flight().await? {
            if queue.requeue(&item).await? {
                moved += 1;
            }
        }
        println!("Requeued {moved} item(s)");
    }

    println!("Queue:      {}", queue.name());
    println!("Visible:    {}", queue.visible_len().await?);
    println!("In flight:  {}", queue.in_flight_len().await?);
    Ok(())
}

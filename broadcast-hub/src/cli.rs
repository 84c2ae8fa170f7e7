use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{
    frame::DEFAULT_MAX_FRAME_BYTES,
    hub::{DeliveryPolicy, HubConfig},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the hub with its HTTP/WebSocket frontend and optional raw TCP frontend.
    Serve(ServeArgs),
    /// Connect to a hub's TCP frontend and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address for the HTTP server (chat page, /ws and /health). Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub http: SocketAddr,

    /// Address for the newline-delimited TCP frontend. Disabled when omitted.
    #[arg(long)]
    pub tcp: Option<SocketAddr>,

    /// Payloads buffered per participant before it counts as unresponsive.
    #[arg(long, default_value_t = 64)]
    pub outbound_capacity: usize,

    /// Wait this long for a full participant queue before evicting it.
    /// Without it a full queue evicts immediately.
    #[arg(long)]
    pub send_timeout_ms: Option<u64>,

    /// Pending join/leave/broadcast requests accepted before callers wait.
    #[arg(long, default_value_t = 256)]
    pub request_capacity: usize,

    /// Longest accepted TCP frame, excluding the newline.
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    pub max_frame_bytes: usize,
}

impl ServeArgs {
    pub fn hub_config(&self) -> HubConfig {
        let delivery = match self.send_timeout_ms {
            Some(ms) => DeliveryPolicy::Timeout(Duration::from_millis(ms)),
            None => DeliveryPolicy::Immediate,
        };
        HubConfig {
            outbound_capacity: self.outbound_capacity,
            request_capacity: self.request_capacity,
            delivery,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the hub's TCP frontend.
    #[arg(long, default_value = "127.0.0.1:9000")]
    pub server: SocketAddr,
}

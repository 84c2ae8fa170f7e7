use anyhow::{Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{info, warn};

use crate::{cli::ClientArgs, frame::LineFrameCodec};

type FrameReader = FramedRead<OwnedReadHalf, LineFrameCodec>;
type FrameWriter = FramedWrite<OwnedWriteHalf, LineFrameCodec>;

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(&args).await?;
    write_stdout(&format!("*** connected to {}", args.server)).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_client_loop(&mut reader, &mut writer, &mut stdin, &mut input).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(args: &ClientArgs) -> Result<(FrameReader, FrameWriter)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((
        FramedRead::new(reader, LineFrameCodec::default()),
        FramedWrite::new(writer, LineFrameCodec::default()),
    ))
}

async fn run_client_loop(
    reader: &mut FrameReader,
    writer: &mut FrameWriter,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            frame = reader.next() => {
                if !handle_frame(frame).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, writer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_frame(frame: Option<io::Result<Bytes>>) -> Result<bool> {
    match frame {
        Some(payload) => {
            write_stdout(&render_payload(&payload?)).await?;
            Ok(true)
        }
        None => {
            write_stdout("*** hub closed the connection").await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    writer: &mut FrameWriter,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end_matches(['\r', '\n']);
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving").await?;
        return Ok(false);
    }

    writer.send(Bytes::copy_from_slice(text.as_bytes())).await?;
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut FrameWriter) {
    if let Err(error) = SinkExt::close(writer).await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

/// Payloads are opaque; show them as text, replacing invalid UTF-8.
fn render_payload(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).into_owned()
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

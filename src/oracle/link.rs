// src/oracle/link.rs - Duplex JSON-lines channel to the oracle
//
// A writer task drains the correlator's outbound queue onto the stream; a
// reader task parses each inbound line and hands it to the correlator.
// Protocol faults (undecodable or oversized lines included) are logged and
// forwarded to whoever owns the link. EOF or an I/O error closes the
// correlator so no caller stays blocked.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::correlator::Correlator;
use super::protocol::{OracleMessage, Request};
use crate::infra::errors::OracleError;

/// Longest inbound line kept in memory; the remainder is discarded.
pub const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// An open channel to the oracle plus its background I/O tasks.
pub struct OracleLink {
    correlator: Arc<Correlator>,
    faults: mpsc::UnboundedReceiver<OracleError>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl OracleLink {
    /// Connect to an oracle server speaking JSON lines over plain TCP.
    ///
    /// A GAMA headless server (the usual `localhost:6868`) talks websocket,
    /// so it needs a line-oriented adapter in front of it.
    pub async fn connect(address: &str, call_timeout: Duration) -> Result<Self, OracleError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| OracleError::Connection(format!("{address}: {e}")))?;
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();
        tracing::info!("Connected to oracle at {}", address);
        Ok(Self::spawn(BufReader::new(read_half), write_half, call_timeout))
    }

    /// Drive a fresh correlator from any duplex byte stream.
    pub fn spawn<R, W>(reader: R, writer: W, call_timeout: Duration) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (correlator, outbound) = Correlator::channel(call_timeout);
        let (fault_tx, faults) = mpsc::unbounded_channel();

        let writer = tokio::spawn(write_loop(outbound, writer, correlator.clone()));
        let reader = tokio::spawn(read_loop(reader, correlator.clone(), fault_tx));

        Self {
            correlator,
            faults,
            reader,
            writer,
        }
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    /// Protocol faults observed since the last call.
    pub fn drain_faults(&mut self) -> Vec<OracleError> {
        let mut out = Vec::new();
        while let Ok(fault) = self.faults.try_recv() {
            out.push(fault);
        }
        out
    }

    /// Fail anything still pending and stop the I/O tasks.
    pub fn shutdown(self) {
        self.correlator.close("oracle link shut down");
    }
}

impl Drop for OracleLink {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

async fn write_loop<W>(
    mut outbound: mpsc::UnboundedReceiver<Request>,
    mut writer: W,
    correlator: Arc<Correlator>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(request) = outbound.recv().await {
        let line = match serde_json::to_string(&request) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(request_id = request.request_id, "Cannot encode request: {}", e);
                correlator.fail_request(request.request_id, e.into());
                continue;
            }
        };

        if let Err(e) = write_line(&mut writer, &line).await {
            correlator.close(&format!("write to oracle failed: {e}"));
            break;
        }
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

async fn read_loop<R>(
    mut reader: R,
    correlator: Arc<Correlator>,
    faults: mpsc::UnboundedSender<OracleError>,
) where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        match read_frame(&mut reader, &mut line, MAX_LINE_BYTES).await {
            Ok(Frame::Eof) => {
                correlator.close("oracle closed the connection");
                break;
            }
            Ok(Frame::Oversized(len)) => {
                let fault = OracleError::Encoding(format!(
                    "inbound line of {len} bytes exceeds {MAX_LINE_BYTES}"
                ));
                tracing::error!("Oracle protocol fault: {}", fault);
                let _ = faults.send(fault);
            }
            Ok(Frame::Line) => {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let outcome = serde_json::from_slice::<OracleMessage>(&line)
                    .map_err(OracleError::from)
                    .and_then(|message| correlator.dispatch(message));
                if let Err(fault) = outcome {
                    tracing::error!("Oracle protocol fault: {}", fault);
                    let _ = faults.send(fault);
                }
            }
            Err(e) => {
                correlator.close(&format!("read from oracle failed: {e}"));
                break;
            }
        }
    }
}

#[derive(Debug, PartialEq)]
enum Frame {
    Line,
    /// Total length of a line that did not fit.
    Oversized(usize),
    Eof,
}

/// Read one `\n`-terminated line as raw bytes, keeping at most `limit` of them.
async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> std::io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    let mut total = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(match total {
                0 => Frame::Eof,
                n if n > limit => Frame::Oversized(n),
                _ => Frame::Line,
            });
        }
        let (chunk, done) = match available.iter().position(|&b| b == b'\n') {
            Some(end) => (&available[..=end], true),
            None => (available, false),
        };
        let room = limit.saturating_sub(buf.len());
        buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
        let used = chunk.len();
        reader.consume(used);
        total += used;
        if done {
            return Ok(if total > limit {
                Frame::Oversized(total)
            } else {
                Frame::Line
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::protocol::{ReplyStatus, SessionId};
    use serde_json::json;
    use tokio::io::{split, DuplexStream, ReadHalf, WriteHalf};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn linked() -> (OracleLink, BufReader<ReadHalf<DuplexStream>>, WriteHalf<DuplexStream>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (cr, cw) = split(client);
        let (sr, sw) = split(server);
        let link = OracleLink::spawn(BufReader::new(cr), cw, TIMEOUT);
        (link, BufReader::new(sr), sw)
    }

    async fn next_request(server: &mut BufReader<ReadHalf<DuplexStream>>) -> Request {
        let mut line = String::new();
        server.read_line(&mut line).await.unwrap();
        serde_json::from_str(line.trim()).unwrap()
    }

    async fn send(server: &mut WriteHalf<DuplexStream>, msg: &OracleMessage) {
        let line = serde_json::to_string(msg).unwrap();
        write_line(server, &line).await.unwrap();
    }

    #[tokio::test]
    async fn test_expression_round_trip_over_stream() {
        let (link, mut srv_in, mut srv_out) = linked();
        let correlator = link.correlator().clone();
        let call = tokio::spawn(async move {
            correlator
                .expression(&SessionId::new("0"), "max_aqi")
                .await
        });

        let req = next_request(&mut srv_in).await;
        send(
            &mut srv_out,
            &OracleMessage::reply_to(&req, ReplyStatus::CommandExecutedSuccessfully, json!("87.5")),
        )
        .await;

        assert_eq!(call.await.unwrap().unwrap(), json!("87.5"));
    }

    #[tokio::test]
    async fn test_stray_reply_surfaces_fault() {
        let (mut link, mut srv_in, mut srv_out) = linked();
        let correlator = link.correlator().clone();
        let call = tokio::spawn(async move { correlator.stop(&SessionId::new("0")).await });

        let mut req = next_request(&mut srv_in).await;
        req.request_id += 1000;
        send(
            &mut srv_out,
            &OracleMessage::reply_to(&req, ReplyStatus::CommandExecutedSuccessfully, json!(null)),
        )
        .await;

        // The stray reply names session 0, so its pending stop fails too.
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, OracleError::Protocol(_)));
        let faults = link.drain_faults();
        assert_eq!(faults.len(), 1);
        assert!(matches!(faults[0], OracleError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_garbage_line_is_a_fault_not_a_crash() {
        let (mut link, _srv_in, mut srv_out) = linked();
        write_line(&mut srv_out, "this is not json").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let faults = link.drain_faults();
        assert!(matches!(faults.as_slice(), [OracleError::Encoding(_)]));
        assert!(!link.correlator().is_closed());
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_is_a_fault_not_a_crash() {
        let (mut link, mut srv_in, mut srv_out) = linked();
        let correlator = link.correlator().clone();
        let call = tokio::spawn(async move { correlator.step(&SessionId::new("7"), 5, true).await });
        let req = next_request(&mut srv_in).await;

        srv_out
            .write_all(b"{\"type\":\"SimulationOutput\",\"content\":\"\xff\"}\n")
            .await
            .unwrap();
        srv_out.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let faults = link.drain_faults();
        assert!(matches!(faults.as_slice(), [OracleError::Encoding(_)]));
        assert!(!link.correlator().is_closed());

        send(
            &mut srv_out,
            &OracleMessage::reply_to(&req, ReplyStatus::CommandExecutedSuccessfully, json!(null)),
        )
        .await;
        assert_eq!(call.await.unwrap().unwrap(), ReplyStatus::CommandExecutedSuccessfully);
    }

    #[tokio::test]
    async fn test_read_frame_caps_long_lines() {
        let mut input: &[u8] = b"0123456789\n{}\ntail";
        let mut buf = Vec::new();

        assert_eq!(read_frame(&mut input, &mut buf, 4).await.unwrap(), Frame::Oversized(11));
        assert_eq!(buf, b"0123");

        buf.clear();
        assert_eq!(read_frame(&mut input, &mut buf, 4).await.unwrap(), Frame::Line);
        assert_eq!(buf, b"{}\n");

        buf.clear();
        assert_eq!(read_frame(&mut input, &mut buf, 4).await.unwrap(), Frame::Line);
        assert_eq!(buf, b"tail");

        buf.clear();
        assert_eq!(read_frame(&mut input, &mut buf, 4).await.unwrap(), Frame::Eof);
    }

    #[tokio::test]
    async fn test_eof_fails_pending_calls() {
        let (link, mut srv_in, srv_out) = linked();
        let correlator = link.correlator().clone();
        let call = tokio::spawn(async move { correlator.step(&SessionId::new("0"), 5, true).await });

        let _req = next_request(&mut srv_in).await;
        drop(srv_out);
        drop(srv_in);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, OracleError::Connection(_)));
        assert!(link.correlator().is_closed());
    }
}

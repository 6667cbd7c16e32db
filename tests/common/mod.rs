//! Minimal MQTT 3.1.1 broker for tests: one listener, QoS 0 only, no topic filtering.
//!
//! Every PUBLISH a client sends is recorded. After the first SUBSCRIBE it sees, the
//! broker pushes a prepared burst of publications to that client.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

pub type Publication = (String, Vec<u8>);

pub struct FakeBroker {
    pub port: u16,
    received: mpsc::UnboundedReceiver<Publication>,
}

impl FakeBroker {
    pub async fn start(burst: Vec<Publication>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (received_tx, received) = mpsc::unbounded_channel();
        let burst = Arc::new(Mutex::new(Some(burst)));

        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let received_tx = received_tx.clone();
                let burst = burst.clone();
                tokio::spawn(async move {
                    let _ = serve(socket, received_tx, burst).await;
                });
            }
        });

        Self { port, received }
    }

    /// Waits until `count` publications arrived or `limit` passed, whichever is first.
    pub async fn collect(&mut self, count: usize, limit: Duration) -> Vec<Publication> {
        let mut out = Vec::with_capacity(count);
        let deadline = tokio::time::Instant::now() + limit;
        while out.len() < count {
            match tokio::time::timeout_at(deadline, self.received.recv()).await {
                Ok(Some(publication)) => out.push(publication),
                _ => break,
            }
        }
        out
    }
}

async fn serve(
    socket: tokio::net::TcpStream,
    received: mpsc::UnboundedSender<Publication>,
    burst: Arc<Mutex<Option<Vec<Publication>>>>,
) -> io::Result<()> {
    let (rd, mut wr) = socket.into_split();
    let mut rd = BufReader::new(rd);
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    tokio::spawn(async move {
        while let Some(frame) = frames_rx.recv().await {
            if wr.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    loop {
        let (header, body) = read_packet(&mut rd).await?;
        match header >> 4 {
            // CONNECT
            1 => {
                let _ = frames_tx.send(vec![0x20, 0x02, 0x00, 0x00]);
            }
            // PUBLISH
            3 => {
                let qos = (header >> 1) & 0x03;
                let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
                let topic = String::from_utf8_lossy(&body[2..2 + topic_len]).into_owned();
                let mut offset = 2 + topic_len;
                if qos > 0 {
                    offset += 2;
                }
                let _ = received.send((topic, body[offset..].to_vec()));
            }
            // SUBSCRIBE
            8 => {
                let mut filters = 0;
                let mut offset = 2;
                while offset < body.len() {
                    let len = u16::from_be_bytes([body[offset], body[offset + 1]]) as usize;
                    offset += 2 + len + 1;
                    filters += 1;
                }
                let mut suback = vec![body[0], body[1]];
                suback.extend(std::iter::repeat(0x00).take(filters));
                let _ = frames_tx.send(frame(0x90, &suback));

                let pending = burst.lock().unwrap().take();
                for (topic, payload) in pending.into_iter().flatten() {
                    let _ = frames_tx.send(publish_frame(&topic, &payload));
                }
            }
            // PINGREQ
            12 => {
                let _ = frames_tx.send(vec![0xD0, 0x00]);
            }
            // DISCONNECT
            14 => return Ok(()),
            _ => {}
        }
    }
}

async fn read_packet(rd: &mut BufReader<OwnedReadHalf>) -> io::Result<(u8, Vec<u8>)> {
    let header = rd.read_u8().await?;
    let mut len = 0usize;
    let mut shift = 0;
    loop {
        let byte = rd.read_u8().await?;
        len |= ((byte & 0x7F) as usize) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut body = vec![0; len];
    rd.read_exact(&mut body).await?;
    Ok((header, body))
}

fn frame(header: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![header];
    let mut len = body.len();
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
    out.extend_from_slice(body);
    out
}

fn publish_frame(topic: &str, payload: &[u8]) -> Vec<u8> {
    let mut body = (topic.len() as u16).to_be_bytes().to_vec();
    body.extend_from_slice(topic.as_bytes());
    body.extend_from_slice(payload);
    frame(0x30, &body)
}

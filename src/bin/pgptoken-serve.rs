//! TCP bridge to the token worker
//!
//! Serves the card over a local socket for testing with host-side
//! tools. Frames are a 4-byte big-endian length followed by a one-byte
//! message type and the message body:
//!
//! - 0x01: command APDU; the reply body is the response APDU
//! - 0x04: reset the card session
//! - 0x06: presence probe
//!
//! Every reply starts with a status byte (0x00 ok, 0x01 error).
//! Connections are served one at a time; commands execute strictly in
//! arrival order.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};

use log::{info, warn};

use pgptoken::card::DataStore;
use pgptoken::worker::TokenWorker;

const MSG_APDU: u8 = 0x01;
const MSG_RESET: u8 = 0x04;
const MSG_PRESENCE: u8 = 0x06;

const STATUS_OK: u8 = 0x00;
const STATUS_ERROR: u8 = 0x01;

fn main() {
    env_logger::init();

    let addr = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("PGPTOKEN_LISTEN").ok())
        .unwrap_or_else(|| "127.0.0.1:9999".to_string());

    let mut store = DataStore::new(None);
    store.load();
    let worker = TokenWorker::spawn(store);

    let listener = match TcpListener::bind(&addr) {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("cannot listen on {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    info!("listening on {}", addr);

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                if let Err(e) = serve(stream, &worker) {
                    warn!("connection ended: {}", e);
                }
            }
            Err(e) => warn!("accept failed: {}", e),
        }
    }
}

fn serve(mut stream: TcpStream, worker: &TokenWorker) -> std::io::Result<()> {
    let peer = stream.peer_addr()?;
    info!("client connected: {}", peer);

    loop {
        let mut len_bytes = [0u8; 4];
        if stream.read_exact(&mut len_bytes).is_err() {
            info!("client disconnected: {}", peer);
            return Ok(());
        }
        let len = u32::from_be_bytes(len_bytes) as usize;

        let mut message = vec![0u8; len];
        stream.read_exact(&mut message)?;

        let reply = match message.split_first() {
            Some((&MSG_APDU, apdu)) => match worker.transmit(apdu) {
                Some(response) => {
                    let mut reply = Vec::with_capacity(1 + response.len());
                    reply.push(STATUS_OK);
                    reply.extend_from_slice(&response);
                    reply
                }
                None => vec![STATUS_ERROR],
            },
            Some((&MSG_RESET, _)) => {
                if worker.reset() {
                    vec![STATUS_OK]
                } else {
                    vec![STATUS_ERROR]
                }
            }
            Some((&MSG_PRESENCE, _)) => vec![STATUS_OK],
            _ => vec![STATUS_ERROR],
        };

        stream.write_all(&(reply.len() as u32).to_be_bytes())?;
        stream.write_all(&reply)?;
        stream.flush()?;
    }
}

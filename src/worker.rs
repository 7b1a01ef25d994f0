//! The token worker
//!
//! One dedicated thread owns the session and the card state. The
//! transport hands a request over a channel and blocks on the paired
//! response channel, so exactly one command is in flight, commands run
//! in delivery order, and the worker never touches a response the
//! transport is still reading.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread::{self, JoinHandle};

use log::{debug, info};

use crate::card::DataStore;
use crate::openpgp::TokenSession;

/// A request to the worker
enum Request {
    /// Execute one command APDU
    Apdu(Vec<u8>),
    /// Power-cycle the card: drop authorizations and file selection
    Reset,
}

/// Transport-side handle to the worker thread.
///
/// Dropping the handle closes the request channel and ends the worker.
pub struct TokenWorker {
    requests: Sender<Request>,
    responses: Receiver<Vec<u8>>,
    thread: Option<JoinHandle<()>>,
}

impl TokenWorker {
    /// Start the worker over a loaded store
    pub fn spawn(store: DataStore) -> Self {
        let (request_tx, request_rx) = channel::<Request>();
        let (response_tx, response_rx) = channel::<Vec<u8>>();

        let thread = thread::spawn(move || {
            run(TokenSession::new(store), request_rx, response_tx);
        });

        Self {
            requests: request_tx,
            responses: response_rx,
            thread: Some(thread),
        }
    }

    /// Execute one command APDU and wait for its response. `None` means
    /// the worker is gone.
    pub fn transmit(&self, apdu: &[u8]) -> Option<Vec<u8>> {
        self.requests.send(Request::Apdu(apdu.to_vec())).ok()?;
        self.responses.recv().ok()
    }

    /// Reset the card session
    pub fn reset(&self) -> bool {
        if self.requests.send(Request::Reset).is_err() {
            return false;
        }
        self.responses.recv().is_ok()
    }
}

impl Drop for TokenWorker {
    fn drop(&mut self) {
        // closing the request sender parks the worker out of its loop
        let (tx, _) = channel();
        drop(std::mem::replace(&mut self.requests, tx));
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Worker loop: wait for a request, run it to completion, answer, wait
/// again. No cancellation and no timeouts; the transport owns bounding.
fn run(mut session: TokenSession, requests: Receiver<Request>, responses: Sender<Vec<u8>>) {
    info!("token worker started");
    while let Ok(request) = requests.recv() {
        let reply = match request {
            Request::Apdu(apdu) => session.process_apdu(&apdu).to_bytes(),
            Request::Reset => {
                debug!("session reset");
                session.reset();
                Vec::new()
            }
        };
        if responses.send(reply).is_err() {
            break;
        }
    }
    info!("token worker stopped");
}

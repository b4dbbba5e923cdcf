//! Echo server on an ephemeral loopback port. Every accepted connection is
//! adopted as a scribe that writes received bytes straight back.
//!
//! Run with `cargo run --example echo`, then `nc 127.0.0.1 <port>`.

use std::io;
use std::rc::Rc;

use brokernet::broker::{AcceptManager, StreamManager};
use brokernet::handle::{AcceptHandle, ConnectionHandle};
use brokernet::handler::Operation;
use brokernet::multiplexer::Multiplexer;
use brokernet::stream::ReceivePolicy;

struct EchoDoorman;

impl AcceptManager for EchoDoorman {
    fn new_connection(&self, dm: &Multiplexer, hdl: AcceptHandle) {
        let Some(sock) = dm.accepted_socket(hdl) else {
            return;
        };
        match dm.add_tcp_scribe_from(Rc::new(EchoScribe), sock) {
            Ok(conn) => {
                if let Err(err) = dm.configure_read(conn, ReceivePolicy::AtMost(4096)) {
                    eprintln!("unable to launch scribe: {err}");
                }
            }
            Err(err) => eprintln!("unable to adopt connection: {err}"),
        }
    }
}

struct EchoScribe;

impl StreamManager for EchoScribe {
    fn consume(&self, dm: &Multiplexer, hdl: ConnectionHandle, data: &[u8]) {
        let _ = dm.write(hdl, data);
        let _ = dm.flush(hdl);
    }

    fn io_failure(&self, dm: &Multiplexer, hdl: ConnectionHandle, op: Operation) {
        if op == Operation::Read {
            let _ = dm.stop_reading(hdl);
        }
    }
}

fn main() -> io::Result<()> {
    let dm = Multiplexer::new()?;
    let (_, port) = dm
        .add_tcp_doorman(Rc::new(EchoDoorman), 0, Some("127.0.0.1"), true)
        .map_err(io::Error::from)?;
    println!("echo server listening on 127.0.0.1:{port}");
    dm.run();
    Ok(())
}

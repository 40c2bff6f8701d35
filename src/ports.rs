use std::io;
use std::net::{TcpListener, TcpStream};

use rand::seq::SliceRandom;

/// Default probing window for ephemeral service containers.
pub const SERVICE_PORT_START: u16 = 33200;
pub const SERVICE_PORT_END: u16 = 33299;

/// Find a free TCP port on localhost in `[start, end]`.
///
/// Probes by attempted connect rather than bind so no socket is held between
/// the check and the eventual `docker run`. Point-in-time check only; the
/// caller tolerates the race. When the whole range is busy, asks the OS for
/// an ephemeral port instead.
pub fn find_free_port(start: u16, end: u16, shuffle: bool) -> io::Result<u16> {
    let mut candidates: Vec<u16> = (start..=end).collect();
    if shuffle {
        candidates.shuffle(&mut rand::thread_rng());
    }

    for port in candidates {
        if TcpStream::connect(("127.0.0.1", port)).is_err() {
            // Nothing accepted the connect, so nothing is listening there.
            return Ok(port);
        }
    }

    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

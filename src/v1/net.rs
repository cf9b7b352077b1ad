use std::{
    error::Error,
    net::{TcpListener, TcpStream},
    sync::Arc,
};

use tracing::{info, warn};

use super::{
    request::Request,
    response::{handle_request, send_res, Response},
    state::State,
};

/// Binds and serves forever. `public_only` restricts the connection to the
/// browser-facing subset of operations.
pub fn listen(addr: &str, state: Arc<State>, public_only: bool) -> Result<(), Box<dyn Error>> {
    let listener = TcpListener::bind(addr)?;
    info!(addr = %listener.local_addr()?, public = public_only, "listening for connections");

    listen_on(listener, state, public_only)
}

/// Accept loop over an already-bound listener. Each connection is handled on
/// its own scoped thread so a slow block stream cannot starve balance
/// queries.
pub fn listen_on(
    listener: TcpListener,
    state: Arc<State>,
    public_only: bool,
) -> Result<(), Box<dyn Error>> {
    crossbeam::scope(|scope| {
        for stream in listener.incoming() {
            match stream {
                Err(err) => warn!(error = %err, "error receiving incoming connection"),
                Ok(conn) => {
                    let state = Arc::clone(&state);
                    scope.spawn(move |_| {
                        if let Err(err) = handle_connection(conn, &state, public_only) {
                            warn!(error = %err, "error handling request");
                        }
                    });
                }
            }
        }
    })
    .unwrap();

    Ok(())
}

fn handle_connection(
    conn: TcpStream,
    state: &Arc<State>,
    public_only: bool,
) -> Result<(), Box<dyn Error>> {
    let req: Request = match bincode::deserialize_from(&conn) {
        Ok(req) => req,
        Err(err) => {
            warn!(error = %err, "received invalid request over TCP");
            return Ok(());
        }
    };

    if public_only && !req.is_public() {
        send_res(
            &Response::Failure(String::from(
                "This operation is not available on the public service",
            )),
            &conn,
        )?;
        return Ok(());
    }

    handle_request(req, conn, state)
}

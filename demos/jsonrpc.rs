//! Request/reply demo: a tiny JSON arithmetic service.
//!
//! A server thread answers `add` requests; the main thread sends one with
//! `get` and waits for the reply routed to its dedicated callback.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;

use serde::{Deserialize, Serialize};

use postbox::{Data, Event, Postbox};

#[derive(Serialize, Deserialize)]
struct AddRequest {
    a: i64,
    b: i64,
}

#[derive(Serialize, Deserialize)]
struct AddResponse {
    sum: i64,
}

fn main() -> postbox::Result<()> {
    let (port_tx, port_rx) = mpsc::channel();

    thread::spawn(move || {
        let mut pb = Postbox::new().expect("runtime");
        let sid = pb.listen("udp://127.0.0.1:0", |pb, conn, event, data| {
            if event == Event::Request {
                let request: AddRequest = match serde_json::from_slice(data.payload()) {
                    Ok(request) => request,
                    Err(e) => {
                        eprintln!("bad request: {}", e);
                        return;
                    }
                };
                let response = AddResponse {
                    sum: request.a + request.b,
                };
                let body = serde_json::to_string(&response).expect("serialize");
                pb.reply(conn, &mut Data::new(&body));
            }
        });
        let port = pb.local_addr(sid).expect("bound").port();
        port_tx.send(port).expect("handshake");
        loop {
            pb.runloop(150);
        }
    });

    let port = port_rx.recv().expect("server port");
    let mut pb = Postbox::new()?;
    let conn = pb.connect(&format!("udp://127.0.0.1:{}", port), |_, _, _, _| {});
    pb.runloop(0);

    let body = serde_json::to_string(&AddRequest { a: 20, b: 22 }).expect("serialize");
    let done = Rc::new(Cell::new(false));
    let seen = done.clone();
    pb.get(conn, &mut Data::new(&body), move |_, _, event, data| {
        if event == Event::Reply {
            println!("reply: {}", data.as_str());
            seen.set(true);
        }
    });

    while !done.get() {
        pb.runloop(150);
    }
    Ok(())
}

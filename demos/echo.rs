//! UDP echo server built on the postbox runtime.
//!
//! Run with `cargo run --example echo`, then throw datagrams at it, e.g.
//! with `socat - UDP:127.0.0.1:4040` from another terminal.

use std::rc::Rc;

use postbox::{Data, Event, Postbox, PostboxConfig, StderrLogger};

fn main() -> postbox::Result<()> {
    let config = PostboxConfig::builder()
        .logger(Rc::new(StderrLogger))
        .build();
    let mut pb = Postbox::with_config(config)?;

    pb.listen("udp://*:4040", |pb, conn, event, data| match event {
        Event::Listening => println!("listening on udp://*:4040"),
        Event::ConnectionReady => println!("peer {} is ready", conn.remote_addr()),
        Event::Message => {
            println!("{} -> {:?}", conn.remote_addr(), data.as_str());
            let mut echo = Data::new(&data.as_str());
            pb.send(conn.id, &mut echo);
        }
        Event::ConnectionClosed => println!("peer closed the connection"),
        Event::Error => eprintln!("error: {}", data.as_str()),
        _ => {}
    });

    loop {
        pb.runloop(150);
    }
}

//! Scripted AT exchange and a framed PPP packet over the in-memory loopback
//! backend, with this process playing both ends of the wire.

use std::sync::Arc;
use std::time::Duration;

use modem_link::backend::loopback;
use modem_link::chat::{Chat, ChatConfig, ChatScript, Match, ScriptStep};
use modem_link::packet::{Family, NetInterface, Packet};
use modem_link::ppp::{Ppp, PppConfig};
use modem_link::sched::WorkQueue;

struct PrintingIface;

impl NetInterface for PrintingIface {
    fn alloc_rx_packet(&self) -> Option<Packet> {
        Some(Packet::new(Family::Unspec, 1500))
    }

    fn recv(&self, packet: Packet) {
        println!("network stack received {} bytes: {:02X?}", packet.len(), packet.as_slice());
    }
}

#[tokio::main]
async fn main() {
    let queue = WorkQueue::new();
    let (pipe, handle) = loopback();

    pipe.open_async().expect("loopback open never fails");
    handle.notify_opened();

    let config = ChatConfig::default().with_unsolicited([Match::new("+CREG: ")
        .with_separators(",")
        .with_callback(|argv| {
            println!(
                "unsolicited registration report, stat={}",
                String::from_utf8_lossy(argv.last().copied().unwrap_or(b""))
            );
        })]);

    let chat = Chat::new(config, &queue).expect("default chat config is valid");
    chat.attach(&pipe);

    let script = Arc::new(
        ChatScript::new("bring-up")
            .with_step(ScriptStep::new("ATE0").with_response(Match::new("OK")))
            .with_step(ScriptStep::new("ATD*99#").with_response(Match::new("CONNECT")))
            .with_abort_match(Match::new("ERROR"))
            .with_callback(|result| println!("script finished: {result:?}"))
            .with_timeout(Duration::from_secs(10)),
    );

    chat.script_run(script).expect("no script is running yet");

    // Play the modem side of the conversation
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("modem got: {:?}", String::from_utf8_lossy(&handle.transmitted()));
    handle.inject(b"OK\r\n");

    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.inject(b"+CREG: 0,1\r\n");
    println!("modem got: {:?}", String::from_utf8_lossy(&handle.transmitted()));
    handle.inject(b"CONNECT\r\n");

    tokio::time::sleep(Duration::from_millis(50)).await;

    // Data mode: hand the pipe to the PPP framer
    chat.release().await;

    let ppp = Ppp::new(PppConfig::default(), &queue, Arc::new(PrintingIface)).expect("default ppp config is valid");
    ppp.attach(&pipe);

    ppp.send(Packet::from_payload(
        Family::Ipv4,
        &[0x45, 0x00, 0x00, 0x14, 0xDE, 0xAD, 0xBE, 0xEF],
    ))
    .expect("framer is attached");

    tokio::time::sleep(Duration::from_millis(50)).await;

    let wire = handle.transmitted();
    println!("wire frame: {wire:02X?}");

    // Echo it back through the receive side
    handle.inject(&wire);
    tokio::time::sleep(Duration::from_millis(50)).await;

    ppp.release().await;
    queue.shutdown().await;
}

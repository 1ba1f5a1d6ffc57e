#![no_main]

use libfuzzer_sys::fuzz_target;

use pollcast::server::protocol::{decode_frame, decode_join, Command};

// Inbound frames come straight off the socket, so both decoders must reject
// anything without panicking.
fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(frame) = decode_frame(text) {
        let _ = frame.command.name();
        let _ = frame.command.required_role();
        if let Command::Vote { weight, .. } = frame.command {
            let _ = u64::try_from(weight);
        }
    }

    if let Ok(request) = decode_join(text) {
        assert_eq!(request.kind, "join");
    }
});

fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use bytes::Bytes;
    use dropwire_protocol::{
        ChunkHeader, ControlFrame, ErrorScope, FRAME_DELIMITER, FileMetadata, Frame, encode_chunk,
    };

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    /// Loads a fixture JSON file and returns it as a `serde_json::Value`.
    fn load_fixture(name: &str) -> serde_json::Value {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    /// Decodes a fixture as a wire frame, re-encodes it, and compares the
    /// JSON values (order-independent).
    fn roundtrip_control(name: &str) -> ControlFrame {
        let fixture = load_fixture(name);
        let wire = Bytes::from(serde_json::to_vec(&fixture).unwrap());

        let frame = match Frame::decode(wire) {
            Ok(Frame::Control(frame)) => frame,
            other => panic!("{name} did not decode as a control frame: {other:?}"),
        };
        let encoded = frame.encode().unwrap();
        assert!(
            !encoded.contains(&FRAME_DELIMITER),
            "{name}: control frame must not contain a newline"
        );

        let reserialized: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(
            fixture, reserialized,
            "roundtrip mismatch for {name}:\n  fixture: {fixture}\n  encoded: {reserialized}"
        );
        frame
    }

    // --- Control frames ---

    #[test]
    fn fixture_metadata() {
        match roundtrip_control("metadata.json") {
            ControlFrame::Metadata { metadata } => {
                assert_eq!(metadata.name, "holiday photo.jpg");
                assert_eq!(metadata.size, 150_000);
                assert_eq!(metadata.content_type, "image/jpeg");
                assert_eq!(metadata.last_modified, 1_700_000_000_000);
            }
            other => panic!("expected metadata, got {other:?}"),
        }
    }

    #[test]
    fn fixture_complete() {
        assert_eq!(roundtrip_control("complete.json"), ControlFrame::Complete);
    }

    #[test]
    fn fixture_ack() {
        assert_eq!(roundtrip_control("ack.json"), ControlFrame::Ack);
    }

    #[test]
    fn fixture_nack() {
        assert_eq!(
            roundtrip_control("nack.json"),
            ControlFrame::Nack {
                missing_chunks: vec![3, 7, 120]
            }
        );
    }

    #[test]
    fn fixture_error() {
        assert_eq!(
            roundtrip_control("error.json"),
            ControlFrame::Error {
                error: "cancelled".into(),
                scope: None,
            }
        );
    }

    #[test]
    fn fixture_error_scoped() {
        assert_eq!(
            roundtrip_control("error_scoped.json"),
            ControlFrame::error(ErrorScope::Send, "cancelled")
        );
    }

    /// Senders that omit `type` and `lastModified` still parse; the
    /// encoder then fills in the defaults.
    #[test]
    fn fixture_metadata_minimal_fills_defaults() {
        let fixture = load_fixture("metadata_minimal.json");
        let wire = Bytes::from(serde_json::to_vec(&fixture).unwrap());

        let Ok(Frame::Control(ControlFrame::Metadata { metadata })) = Frame::decode(wire) else {
            panic!("metadata_minimal.json did not decode as metadata");
        };
        assert_eq!(
            metadata,
            FileMetadata {
                name: "notes.txt".into(),
                size: 0,
                content_type: String::new(),
                last_modified: 0,
            }
        );

        let encoded: serde_json::Value = serde_json::from_slice(
            &ControlFrame::Metadata { metadata }.encode().unwrap(),
        )
        .unwrap();
        assert_eq!(encoded["metadata"]["type"], "");
        assert_eq!(encoded["metadata"]["lastModified"], 0);
    }

    // --- Chunk frames ---

    #[test]
    fn fixture_chunk_header_layout() {
        let fixture = load_fixture("chunk_header.json");
        let payload = b"raw\nbytes\n\x00\xff";

        let mut wire = serde_json::to_vec(&fixture).unwrap();
        wire.push(b'\n');
        wire.extend_from_slice(payload);

        let frame = Frame::decode(Bytes::from(wire)).unwrap();
        let header = ChunkHeader {
            index: 2,
            total_chunks: 3,
        };
        assert_eq!(
            frame,
            Frame::Chunk {
                header,
                payload: Bytes::from_static(payload),
            }
        );

        // Our encoder produces the same header JSON.
        let encoded = encode_chunk(header, payload).unwrap();
        let split = encoded.iter().position(|&b| b == b'\n').unwrap();
        let header_json: serde_json::Value = serde_json::from_slice(&encoded[..split]).unwrap();
        assert_eq!(header_json, fixture);
        assert_eq!(&encoded[split + 1..], payload);
    }

    #[test]
    fn chunk_header_with_wrong_type_is_rejected() {
        let mut fixture = load_fixture("chunk_header.json");
        fixture["type"] = serde_json::json!("metadata");

        let mut wire = serde_json::to_vec(&fixture).unwrap();
        wire.push(b'\n');
        wire.extend_from_slice(b"payload");

        assert!(Frame::decode(Bytes::from(wire)).is_err());
    }
}

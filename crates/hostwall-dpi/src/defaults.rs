//! Built-in signature set

use crate::{Classification, SignatureSpec};

/// Signatures installed when `dpi.load_defaults` is on
///
/// Order matters: the engine stops at the first match.
pub fn default_signatures() -> Vec<SignatureSpec> {
    vec![
        SignatureSpec::new(
            "HTTP",
            r"^(?:GET|POST|PUT|HEAD|DELETE|OPTIONS|PATCH|CONNECT) |^HTTP/1\.[01] ",
            Classification::Http,
            false,
        ),
        // TLS handshake record; ahead of DNS since a ClientHello length
        // often starts with 01 00
        SignatureSpec::new("TLS", r"^\x16\x03[\x00-\x04]", Classification::Tls, false),
        SignatureSpec::new("SSH", r"^SSH-[12]\.", Classification::Ssh, false),
        // DNS standard query with recursion desired, after the 2-byte id
        SignatureSpec::new("DNS", r"(?s)^.{2}\x01\x00", Classification::Dns, false),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SignatureEngine;

    #[test]
    fn test_defaults_compile() {
        let engine = SignatureEngine::new();
        for spec in default_signatures() {
            engine.add(spec).unwrap();
        }
        assert_eq!(engine.len(), 4);
    }

    #[test]
    fn test_default_classifications() {
        let engine = SignatureEngine::with_defaults().unwrap();

        let cases: Vec<(&[u8], Classification)> = vec![
            (&b"GET /index.html HTTP/1.1\r\nHost: a\r\n\r\n"[..], Classification::Http),
            (&b"HTTP/1.1 200 OK\r\n"[..], Classification::Http),
            (&[0x16, 0x03, 0x01, 0x00, 0xc8, 0x01][..], Classification::Tls),
            (&b"SSH-2.0-OpenSSH_9.6\r\n"[..], Classification::Ssh),
            (&[0xab, 0xcd, 0x01, 0x00, 0x00, 0x01][..], Classification::Dns),
            (&b"\x00\x00\x00\x00garbage"[..], Classification::Unknown),
        ];

        for (payload, expected) in cases {
            assert_eq!(engine.inspect(payload).classification, expected, "{payload:?}");
        }
    }

    #[test]
    fn test_dns_id_may_contain_newline() {
        let engine = SignatureEngine::with_defaults().unwrap();
        let payload = [b'\n', b'\n', 0x01, 0x00, 0x00, 0x01];
        assert_eq!(engine.inspect(&payload).classification, Classification::Dns);
    }
}

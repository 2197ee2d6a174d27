//! Mapping from engine status values to the public error taxonomy.

use keel_types::{codes, TlsError};
use rustls::AlertDescription;

/// Convert a fatal engine error into a [`TlsError`].
///
/// Local certificate-verification failures become `Verify` errors so the
/// driver can attach the peer's distinguished names; everything else becomes
/// a `Protocol` error carrying a stable code plus the engine's own rendering
/// of the failure as an attached detail.
pub(crate) fn map_engine_error(err: &rustls::Error) -> TlsError {
    match err {
        rustls::Error::InvalidCertificate(_) => TlsError::Verify {
            reason: err.to_string(),
            subject: None,
            issuer: None,
        },
        rustls::Error::NoCertificatesPresented => TlsError::Verify {
            reason: "no certificate presented by peer".into(),
            subject: None,
            issuer: None,
        },
        _ => TlsError::Protocol {
            code: classify(err),
            reason: err.to_string(),
            details: vec![format!("{err:?}")],
        },
    }
}

fn classify(err: &rustls::Error) -> i32 {
    match err {
        rustls::Error::InappropriateHandshakeMessage { .. } => {
            codes::ERROR_UNEXPECTED_HANDSHAKE_PACKET
        }
        rustls::Error::InappropriateMessage { .. } | rustls::Error::InvalidMessage(_) => {
            codes::ERROR_UNEXPECTED_PACKET
        }
        rustls::Error::DecryptError => codes::ERROR_DECRYPTION_FAILED,
        rustls::Error::PeerSentOversizedRecord => codes::ERROR_UNEXPECTED_PACKET,
        rustls::Error::PeerIncompatible(incompatible) => {
            // The engine folds suite and version mismatches into one family.
            if format!("{incompatible:?}").contains("CipherSuites") {
                codes::ERROR_NO_CIPHER_SUITES
            } else {
                codes::ERROR_UNSUPPORTED_VERSION
            }
        }
        rustls::Error::PeerMisbehaved(_) => codes::ERROR_UNEXPECTED_PACKET,
        rustls::Error::AlertReceived(alert) => match alert {
            AlertDescription::BadRecordMac => codes::ERROR_MAC_VERIFY_FAILED,
            AlertDescription::DecryptionFailed | AlertDescription::DecryptError => {
                codes::ERROR_DECRYPTION_FAILED
            }
            AlertDescription::DecompressionFailure => codes::ERROR_UNKNOWN_COMPRESSION_ALGORITHM,
            AlertDescription::ProtocolVersion => codes::ERROR_UNSUPPORTED_VERSION,
            AlertDescription::HandshakeFailure | AlertDescription::InsufficientSecurity => {
                codes::ERROR_NO_CIPHER_SUITES
            }
            AlertDescription::NoRenegotiation => codes::ERROR_UNSAFE_RENEGOTIATION_DENIED,
            AlertDescription::UnexpectedMessage => codes::ERROR_UNEXPECTED_PACKET,
            _ => codes::ERROR_UNEXPECTED_PACKET,
        },
        _ => codes::ERROR_UNEXPECTED_PACKET,
    }
}

/// Error for ciphertext the engine refused to accept.
pub(crate) fn feed_rejected(err: &std::io::Error) -> TlsError {
    TlsError::Protocol {
        code: codes::ERROR_PULL,
        reason: format!("engine rejected inbound ciphertext: {err}"),
        details: Vec::new(),
    }
}

/// Error for a peer that vanished without sending close_notify.
pub(crate) fn premature_termination() -> TlsError {
    TlsError::Protocol {
        code: codes::ERROR_PREMATURE_TERMINATION,
        reason: "peer closed connection without close_notify".into(),
        details: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_types::ErrorKind;

    #[test]
    fn test_cert_failures_map_to_verify() {
        let err = rustls::Error::InvalidCertificate(rustls::CertificateError::Expired);
        assert_eq!(map_engine_error(&err).kind(), ErrorKind::Verify);

        let err = rustls::Error::NoCertificatesPresented;
        let mapped = map_engine_error(&err);
        assert_eq!(mapped.kind(), ErrorKind::Verify);
        assert!(mapped
            .to_string()
            .contains("no certificate presented by peer"));
    }

    #[test]
    fn test_alert_mapping() {
        let err = rustls::Error::AlertReceived(AlertDescription::BadRecordMac);
        assert_eq!(
            map_engine_error(&err).code(),
            Some(codes::ERROR_MAC_VERIFY_FAILED)
        );

        let err = rustls::Error::AlertReceived(AlertDescription::ProtocolVersion);
        assert_eq!(
            map_engine_error(&err).code(),
            Some(codes::ERROR_UNSUPPORTED_VERSION)
        );
    }

    #[test]
    fn test_garbage_input_maps_to_unexpected_packet() {
        let err = rustls::Error::InvalidMessage(rustls::InvalidMessage::InvalidContentType);
        assert_eq!(
            map_engine_error(&err).code(),
            Some(codes::ERROR_UNEXPECTED_PACKET)
        );
    }

    #[test]
    fn test_premature_termination_code() {
        assert_eq!(
            premature_termination().code(),
            Some(codes::ERROR_PREMATURE_TERMINATION)
        );
    }
}

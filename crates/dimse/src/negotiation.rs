//! Acceptor side of association negotiation for pushed sub-associations
//!
//! Each proposed presentation context gets the first transfer syntax of *our*
//! preference list that the archive also proposed, whatever order the archive
//! listed them in.

use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_ul::pdu::{
    AssociationAC, AssociationRJ, AssociationRJResult, AssociationRJServiceProviderASCEReason,
    AssociationRJServiceUserReason, AssociationRJSource, AssociationRQ,
    PresentationContextNegotiated, PresentationContextResult, PresentationContextResultReason,
    UserVariableItem, DEFAULT_MAX_PDU,
};
use dicom_ul::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

use crate::transport::AcceptPolicy;
use crate::types::trim_uid;

/// DICOM Application Context Name
pub const APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

const PROTOCOL_VERSION: u16 = 1;

/// Transfer syntax reported for contexts that were not accepted
const FALLBACK_TRANSFER_SYNTAX: &str = "1.2.840.10008.1.2";

/// Outcome of a successful negotiation
#[derive(Debug, Clone, PartialEq)]
pub struct Negotiated {
    /// A-ASSOCIATE-AC to send back
    pub response: AssociationAC,
    pub presentation_contexts: Vec<PresentationContextNegotiated>,
    pub peer_ae_title: String,
    /// Largest PDU the peer accepts from us
    pub peer_max_pdu: u32,
}

/// Answer an A-ASSOCIATE-RQ, or say why it is rejected
pub fn negotiate(
    request: AssociationRQ,
    policy: &AcceptPolicy,
    ae_title: &str,
    max_pdu: u32,
) -> Result<Negotiated, AssociationRJ> {
    if request.protocol_version & PROTOCOL_VERSION == 0 {
        return Err(AssociationRJ {
            result: AssociationRJResult::Permanent,
            source: AssociationRJSource::ServiceProviderASCE(
                AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported,
            ),
        });
    }
    if trim_uid(&request.application_context_name) != APPLICATION_CONTEXT_NAME {
        return Err(AssociationRJ {
            result: AssociationRJResult::Permanent,
            source: AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
            ),
        });
    }

    let peer_max_pdu = match request.user_variables.iter().find_map(|item| match item {
        UserVariableItem::MaxLength(len) => Some(*len),
        _ => None,
    }) {
        // 0 means unlimited
        Some(0) => u32::MAX,
        Some(len) => len,
        None => DEFAULT_MAX_PDU,
    };

    let presentation_contexts: Vec<PresentationContextNegotiated> = request
        .presentation_contexts
        .into_iter()
        .map(|pc| {
            let abstract_syntax = trim_uid(&pc.abstract_syntax).to_string();
            let (reason, transfer_syntax) = if !policy
                .abstract_syntaxes
                .iter()
                .any(|uid| uid == &abstract_syntax)
            {
                (
                    PresentationContextResultReason::AbstractSyntaxNotSupported,
                    FALLBACK_TRANSFER_SYNTAX.to_string(),
                )
            } else {
                match choose_transfer_syntax(&pc.transfer_syntaxes, &policy.transfer_syntaxes) {
                    Some(ts) => (PresentationContextResultReason::Acceptance, ts),
                    None => (
                        PresentationContextResultReason::TransferSyntaxesNotSupported,
                        FALLBACK_TRANSFER_SYNTAX.to_string(),
                    ),
                }
            };
            PresentationContextNegotiated {
                id: pc.id,
                reason,
                transfer_syntax,
                abstract_syntax,
            }
        })
        .collect();

    let response = AssociationAC {
        protocol_version: PROTOCOL_VERSION,
        calling_ae_title: request.calling_ae_title.clone(),
        // answer with the title we were called by
        called_ae_title: if request.called_ae_title.trim().is_empty() {
            ae_title.to_string()
        } else {
            request.called_ae_title
        },
        application_context_name: request.application_context_name,
        presentation_contexts: presentation_contexts
            .iter()
            .map(|pc| PresentationContextResult {
                id: pc.id,
                reason: pc.reason.clone(),
                transfer_syntax: pc.transfer_syntax.clone(),
            })
            .collect(),
        user_variables: vec![
            UserVariableItem::MaxLength(max_pdu),
            UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
        ],
    };

    Ok(Negotiated {
        response,
        presentation_contexts,
        peer_ae_title: request.calling_ae_title.trim().to_string(),
        peer_max_pdu,
    })
}

/// First of `preferred` that was `proposed` and that we can decode
pub fn choose_transfer_syntax(proposed: &[String], preferred: &[String]) -> Option<String> {
    preferred
        .iter()
        .map(|uid| trim_uid(uid))
        .find(|uid| {
            proposed.iter().any(|p| trim_uid(p) == *uid)
                && TransferSyntaxRegistry.get(uid).is_some()
        })
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_ul::pdu::PresentationContextProposed;

    const JPEG_LOSSLESS_SV1: &str = "1.2.840.10008.1.2.4.70";
    const EXPLICIT_LE: &str = "1.2.840.10008.1.2.1";
    const EXPLICIT_BE: &str = "1.2.840.10008.1.2.2";
    const IMPLICIT_LE: &str = "1.2.840.10008.1.2";
    const CT: &str = "1.2.840.10008.5.1.4.1.1.2";

    fn policy() -> AcceptPolicy {
        AcceptPolicy {
            abstract_syntaxes: vec![crate::command::VERIFICATION.to_string(), CT.to_string()],
            transfer_syntaxes: vec![
                JPEG_LOSSLESS_SV1.to_string(),
                EXPLICIT_LE.to_string(),
                EXPLICIT_BE.to_string(),
                IMPLICIT_LE.to_string(),
            ],
        }
    }

    fn request(contexts: Vec<PresentationContextProposed>) -> AssociationRQ {
        AssociationRQ {
            protocol_version: 1,
            calling_ae_title: "ARCHIVE".to_string(),
            called_ae_title: "RETRIEVE_SCU".to_string(),
            application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: contexts,
            user_variables: vec![UserVariableItem::MaxLength(32768)],
        }
    }

    fn proposed(id: u8, abstract_syntax: &str, ts: &[&str]) -> PresentationContextProposed {
        PresentationContextProposed {
            id,
            abstract_syntax: abstract_syntax.to_string(),
            transfer_syntaxes: ts.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn jpeg_lossless_wins_even_when_proposed_last() {
        let negotiated = negotiate(
            request(vec![proposed(1, CT, &[IMPLICIT_LE, EXPLICIT_LE, JPEG_LOSSLESS_SV1])]),
            &policy(),
            "RETRIEVE_SCU",
            65536,
        )
        .unwrap();

        let pc = &negotiated.presentation_contexts[0];
        assert_eq!(pc.reason, PresentationContextResultReason::Acceptance);
        assert_eq!(pc.transfer_syntax, JPEG_LOSSLESS_SV1);
        assert_eq!(
            negotiated.response.presentation_contexts[0].transfer_syntax,
            JPEG_LOSSLESS_SV1
        );
    }

    #[test]
    fn explicit_little_endian_beats_implicit() {
        let negotiated = negotiate(
            request(vec![proposed(3, CT, &[IMPLICIT_LE, EXPLICIT_BE, EXPLICIT_LE])]),
            &policy(),
            "RETRIEVE_SCU",
            65536,
        )
        .unwrap();
        assert_eq!(negotiated.presentation_contexts[0].transfer_syntax, EXPLICIT_LE);
    }

    #[test]
    fn each_context_is_negotiated_on_its_own() {
        let negotiated = negotiate(
            request(vec![
                proposed(1, CT, &[IMPLICIT_LE, JPEG_LOSSLESS_SV1]),
                proposed(3, CT, &[IMPLICIT_LE]),
                proposed(5, "1.2.3.4.5", &[IMPLICIT_LE]),
                proposed(7, CT, &["1.2.840.10008.1.2.4.50"]),
            ]),
            &policy(),
            "RETRIEVE_SCU",
            65536,
        )
        .unwrap();

        let results: Vec<_> = negotiated
            .presentation_contexts
            .iter()
            .map(|pc| (pc.id, pc.reason.clone(), pc.transfer_syntax.as_str()))
            .collect();
        assert_eq!(
            results,
            vec![
                (1, PresentationContextResultReason::Acceptance, JPEG_LOSSLESS_SV1),
                (3, PresentationContextResultReason::Acceptance, IMPLICIT_LE),
                (
                    5,
                    PresentationContextResultReason::AbstractSyntaxNotSupported,
                    IMPLICIT_LE
                ),
                (
                    7,
                    PresentationContextResultReason::TransferSyntaxesNotSupported,
                    IMPLICIT_LE
                ),
            ]
        );
        assert_eq!(negotiated.peer_ae_title, "ARCHIVE");
        assert_eq!(negotiated.peer_max_pdu, 32768);
    }

    #[test]
    fn padded_uids_are_matched() {
        let chosen = choose_transfer_syntax(
            &[format!("{}\0", EXPLICIT_LE)],
            &policy().transfer_syntaxes,
        );
        assert_eq!(chosen.as_deref(), Some(EXPLICIT_LE));
    }

    #[test]
    fn unknown_application_context_is_rejected() {
        let mut rq = request(vec![proposed(1, CT, &[IMPLICIT_LE])]);
        rq.application_context_name = "1.2.3".to_string();

        let rejection = negotiate(rq, &policy(), "RETRIEVE_SCU", 65536).unwrap_err();
        assert_eq!(
            rejection.source,
            AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported
            )
        );
    }

    #[test]
    fn missing_max_length_uses_default() {
        let mut rq = request(vec![proposed(1, CT, &[IMPLICIT_LE])]);
        rq.user_variables.clear();
        let negotiated = negotiate(rq, &policy(), "RETRIEVE_SCU", 65536).unwrap();
        assert_eq!(negotiated.peer_max_pdu, DEFAULT_MAX_PDU);
    }
}

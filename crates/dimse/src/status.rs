//! Translation of final C-MOVE statuses into retrieve outcomes
//!
//! The archive reports the overall result of a retrieve in the status of its
//! last C-MOVE response (PS3.4 C.4.2.1.5). Failure and warning statuses come
//! with "related fields" (PS3.7 Annex C) that explain what went wrong; those are
//! dumped to the log as `<field-name> (<tag>): <value>` when present.

use dicom_core::{DataDictionary, Tag};
use dicom_dictionary_std::{tags, StandardDataDictionary};
use dicom_object::InMemDicomObject;
use tracing::{error, info, warn};

use crate::command::status;
use crate::types::{MoveFailure, RetrieveOutcome, SubOperationCounters};

const ERROR_COMMENT_FIELDS: &[Tag] = &[tags::ERROR_COMMENT];

const SUB_OPERATION_FIELDS: &[Tag] = &[
    tags::NUMBER_OF_REMAINING_SUBOPERATIONS,
    tags::NUMBER_OF_COMPLETED_SUBOPERATIONS,
    tags::NUMBER_OF_FAILED_SUBOPERATIONS,
    tags::NUMBER_OF_WARNING_SUBOPERATIONS,
];

const IDENTIFIER_FIELDS: &[Tag] = &[tags::OFFENDING_ELEMENT, tags::ERROR_COMMENT];

const WARNING_FIELDS: &[Tag] = &[
    tags::NUMBER_OF_REMAINING_SUBOPERATIONS,
    tags::NUMBER_OF_FAILED_SUBOPERATIONS,
    tags::NUMBER_OF_WARNING_SUBOPERATIONS,
];

/// Human-readable meaning of a C-MOVE status code
pub fn describe(code: u16) -> &'static str {
    match code {
        status::SUCCESS => "Success",
        status::PENDING => "Pending: sub-operations are continuing",
        status::PENDING_WITH_WARNINGS => "Pending: sub-operations are continuing with warnings",
        status::MOVE_REFUSED_OUT_OF_RESOURCES_MATCHES => {
            "Refused: Out of resources - Unable to calculate number of matches"
        }
        status::MOVE_REFUSED_OUT_OF_RESOURCES_SUB_OPERATIONS => {
            "Refused: Out of resources - Unable to perform sub-operations"
        }
        status::MOVE_FAILED_DESTINATION_UNKNOWN => "Refused: Move destination unknown",
        status::MOVE_FAILED_IDENTIFIER_DOES_NOT_MATCH_SOP_CLASS => {
            "Failed: Identifier does not match SOP class"
        }
        status::MOVE_FAILED_UNABLE_TO_PROCESS => "Failed: Unable to process",
        status::MOVE_WARNING_SUB_OPERATIONS_FAILED => {
            "Warning: Sub-operations complete - One or more failures"
        }
        0xFE00 => "Cancel: Sub-operations terminated due to cancel indication",
        _ => "Unknown status",
    }
}

/// Related fields that explain a given status (empty for unrecognized codes)
pub fn related_fields(code: u16) -> &'static [Tag] {
    match code {
        status::MOVE_REFUSED_OUT_OF_RESOURCES_MATCHES => ERROR_COMMENT_FIELDS,
        status::MOVE_REFUSED_OUT_OF_RESOURCES_SUB_OPERATIONS => SUB_OPERATION_FIELDS,
        status::MOVE_FAILED_DESTINATION_UNKNOWN => ERROR_COMMENT_FIELDS,
        status::MOVE_FAILED_IDENTIFIER_DOES_NOT_MATCH_SOP_CLASS
        | status::MOVE_FAILED_UNABLE_TO_PROCESS => IDENTIFIER_FIELDS,
        status::MOVE_WARNING_SUB_OPERATIONS_FAILED => WARNING_FIELDS,
        _ => &[],
    }
}

/// Format the related fields of `code` found in `detail`, one line per field.
///
/// Fields missing from the detail data set are skipped.
pub fn status_detail_lines(code: u16, detail: &InMemDicomObject) -> Vec<String> {
    related_fields(code)
        .iter()
        .filter_map(|tag| {
            let value = detail.element(*tag).ok()?.to_str().ok()?;
            let name = StandardDataDictionary
                .by_tag(*tag)
                .map(|entry| entry.alias)
                .unwrap_or("Unknown");
            Some(format!("{} {}: {}", name, tag, value.trim_end_matches('\0').trim()))
        })
        .collect()
}

/// Turn the final C-MOVE status into the outcome reported to the caller.
///
/// Never fails: codes outside the table degrade to an unknown failure.
pub fn translate(
    code: u16,
    counters: SubOperationCounters,
    status_detail: Option<&InMemDicomObject>,
) -> RetrieveOutcome {
    const RETRIEVE_FAILED: &str = "Could not retrieve the study, status received";

    let outcome = match code {
        status::SUCCESS => return RetrieveOutcome::Success,
        status::MOVE_REFUSED_OUT_OF_RESOURCES_MATCHES
        | status::MOVE_REFUSED_OUT_OF_RESOURCES_SUB_OPERATIONS
        | status::MOVE_FAILED_IDENTIFIER_DOES_NOT_MATCH_SOP_CLASS
        | status::MOVE_FAILED_UNABLE_TO_PROCESS => {
            error!("{} 0x{:04X}: {}", RETRIEVE_FAILED, code, describe(code));
            RetrieveOutcome::Failure(MoveFailure::MoveRefused { status: code })
        }
        status::MOVE_FAILED_DESTINATION_UNKNOWN => {
            // the archive does not have our AE title registered
            error!("{} 0x{:04X}: {}", RETRIEVE_FAILED, code, describe(code));
            RetrieveOutcome::Failure(MoveFailure::DestinationUnknown { status: code })
        }
        status::MOVE_WARNING_SUB_OPERATIONS_FAILED => {
            warn!(
                "The study could not be retrieved completely, status received 0x{:04X}: {}",
                code,
                describe(code)
            );
            RetrieveOutcome::PartialSuccess(counters)
        }
        _ => {
            error!("{} 0x{:04X}: {}", RETRIEVE_FAILED, code, describe(code));
            RetrieveOutcome::Failure(MoveFailure::Unknown { status: code })
        }
    };

    if let Some(detail) = status_detail {
        let lines = status_detail_lines(code, detail);
        if !lines.is_empty() {
            info!("Status details");
            for line in lines {
                info!("{}", line);
            }
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::{dicom_value, DataElement, VR};

    fn detail(elements: Vec<DataElement<InMemDicomObject>>) -> InMemDicomObject {
        InMemDicomObject::from_element_iter(elements)
    }

    fn counts(remaining: u16, failed: u16, warning: u16) -> InMemDicomObject {
        detail(vec![
            DataElement::new(
                tags::NUMBER_OF_REMAINING_SUBOPERATIONS,
                VR::US,
                dicom_value!(U16, [remaining]),
            ),
            DataElement::new(
                tags::NUMBER_OF_FAILED_SUBOPERATIONS,
                VR::US,
                dicom_value!(U16, [failed]),
            ),
            DataElement::new(
                tags::NUMBER_OF_WARNING_SUBOPERATIONS,
                VR::US,
                dicom_value!(U16, [warning]),
            ),
        ])
    }

    #[test]
    fn success_is_success() {
        assert_eq!(
            translate(0x0000, SubOperationCounters::default(), None),
            RetrieveOutcome::Success
        );
    }

    #[test]
    fn table_codes_translate_with_and_without_detail() {
        let comment = detail(vec![DataElement::new(
            tags::ERROR_COMMENT,
            VR::LO,
            dicom_value!(Str, "too many matches"),
        )]);
        let cases = [
            (0xA701, RetrieveOutcome::Failure(MoveFailure::MoveRefused { status: 0xA701 })),
            (0xA702, RetrieveOutcome::Failure(MoveFailure::MoveRefused { status: 0xA702 })),
            (
                0xA801,
                RetrieveOutcome::Failure(MoveFailure::DestinationUnknown { status: 0xA801 }),
            ),
            (0xA900, RetrieveOutcome::Failure(MoveFailure::MoveRefused { status: 0xA900 })),
            (0xC000, RetrieveOutcome::Failure(MoveFailure::MoveRefused { status: 0xC000 })),
            (
                0xB000,
                RetrieveOutcome::PartialSuccess(SubOperationCounters::default()),
            ),
            (0xFE00, RetrieveOutcome::Failure(MoveFailure::Unknown { status: 0xFE00 })),
            (0x0122, RetrieveOutcome::Failure(MoveFailure::Unknown { status: 0x0122 })),
        ];

        for (code, expected) in cases {
            let counters = SubOperationCounters::default();
            assert_eq!(translate(code, counters, None), expected, "code {:04X}", code);
            assert_eq!(
                translate(code, counters, Some(&comment)),
                expected,
                "code {:04X} with detail",
                code
            );
        }
    }

    #[test]
    fn warning_detail_produces_three_lines() {
        let lines = status_detail_lines(0xB000, &counts(0, 2, 1));
        assert_eq!(
            lines,
            vec![
                "NumberOfRemainingSuboperations (0000,1020): 0".to_string(),
                "NumberOfFailedSuboperations (0000,1022): 2".to_string(),
                "NumberOfWarningSuboperations (0000,1023): 1".to_string(),
            ]
        );
    }

    #[test]
    fn missing_fields_are_skipped() {
        let lines = status_detail_lines(0xA702, &counts(5, 1, 0));
        // completed count absent from the detail
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().all(|l| !l.contains("Completed")));

        assert!(status_detail_lines(0xA801, &counts(0, 0, 0)).is_empty());
    }

    #[test]
    fn unrecognized_codes_have_no_related_fields() {
        assert!(related_fields(0x1234).is_empty());
        assert!(status_detail_lines(0x1234, &counts(1, 1, 1)).is_empty());
        assert_eq!(describe(0x1234), "Unknown status");
    }

    #[test]
    fn identifier_failures_log_offending_element_first() {
        assert_eq!(
            related_fields(0xC000),
            &[tags::OFFENDING_ELEMENT, tags::ERROR_COMMENT]
        );
        assert_eq!(related_fields(0xA900), related_fields(0xC000));
    }
}

//! Property tests for crop parsing and the detection payload

use minori_core::protocol::{DetectionResponse, DetectionResult, ServerMessage};
use minori_core::Crop;
use proptest::prelude::*;

proptest! {
    #[test]
    fn crop_parse_never_panics(input in ".*") {
        let _ = input.parse::<Crop>();
    }

    #[test]
    fn crop_parse_accepts_any_casing(upper in proptest::bool::ANY, pad in 0usize..4) {
        for crop in Crop::ALL {
            let mut name = crop.as_str().to_string();
            if upper {
                name = name.to_uppercase();
            }
            let padded = format!("{}{}{}", " ".repeat(pad), name, " ".repeat(pad));
            prop_assert_eq!(padded.parse::<Crop>().unwrap(), crop);
        }
    }

    #[test]
    fn failed_payload_always_carries_message(error in proptest::option::of(".*")) {
        let response = DetectionResponse {
            success: false,
            error,
            ..DetectionResponse::default()
        };
        match response.into_result() {
            DetectionResult::Failed { error } => prop_assert!(!error.trim().is_empty()),
            DetectionResult::Detected(_) => prop_assert!(false, "failure reported as success"),
        }
    }

    #[test]
    fn result_envelope_echoes_crop(disease in "[a-z_]{1,20}", secs in 0.0f64..10.0) {
        for crop in Crop::ALL {
            let text = serde_json::json!({
                "type": "result",
                "data": {
                    "success": true,
                    "crop": crop.as_str(),
                    "detected_disease": disease,
                    "solution": "rotate crops",
                    "processing_time": secs,
                }
            })
            .to_string();
            let result = ServerMessage::parse_result(&text).unwrap().unwrap();
            let detection = result.detection().unwrap();
            prop_assert!(detection.matches_crop(crop));
            prop_assert_eq!(&detection.detected_disease, &disease);
        }
    }
}

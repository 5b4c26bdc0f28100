use super::*;
use serde_json::json;

#[test]
fn content_type_roundtrips_through_strings() {
    for content_type in ContentType::ALL {
        let parsed: ContentType = content_type
            .as_str()
            .parse()
            .expect("Failed to parse content type");
        assert_eq!(parsed, content_type);
    }

    assert_eq!("MENU".parse::<ContentType>(), Ok(ContentType::Menu));
    assert_eq!(" faq ".parse::<ContentType>(), Ok(ContentType::Faq));
    assert!("drinks".parse::<ContentType>().is_err());
}

#[test]
fn content_type_serializes_uppercase() {
    let value = serde_json::to_value(ContentType::Policy).expect("Failed to serialize");
    assert_eq!(value, json!("POLICY"));

    let parsed: ContentType =
        serde_json::from_value(json!("BUSINESS")).expect("Failed to deserialize");
    assert_eq!(parsed, ContentType::Business);
}

#[test]
fn payload_tag_matches_content_type() {
    let payload = ContentPayload::Menu(MenuItem {
        name: "Margherita".to_string(),
        description: "Tomato and mozzarella".to_string(),
        category: Some("Pizza".to_string()),
        price: Some(12.5),
        extra: BTreeMap::new(),
    });

    let value = serde_json::to_value(&payload).expect("Failed to serialize payload");
    assert_eq!(value["type"], json!("MENU"));
    assert_eq!(value["name"], json!("Margherita"));
    assert_eq!(payload.content_type(), ContentType::Menu);
}

#[test]
fn payload_deserializes_from_tagged_json() {
    let payload: ContentPayload = serde_json::from_value(json!({
        "type": "FAQ",
        "question": "Do you deliver?",
        "answer": "Yes, within 5 km."
    }))
    .expect("Failed to deserialize payload");

    assert_eq!(payload.content_type(), ContentType::Faq);
    assert_eq!(payload.title(), "Do you deliver?");
}

#[test]
fn unknown_fields_land_in_extension_map() {
    let payload: ContentPayload = serde_json::from_value(json!({
        "type": "MENU",
        "name": "Calzone",
        "spicyLevel": 2,
        "allergens": ["gluten"]
    }))
    .expect("Failed to deserialize payload");

    let ContentPayload::Menu(item) = &payload else {
        panic!("Expected menu payload");
    };
    assert_eq!(item.extra.get("spicyLevel"), Some(&json!(2)));
    assert_eq!(item.extra.get("allergens"), Some(&json!(["gluten"])));

    // Extension fields survive a serialize round trip.
    let value = serde_json::to_value(&payload).expect("Failed to reserialize");
    assert_eq!(value["spicyLevel"], json!(2));
}

#[test]
fn embedding_text_is_deterministic() {
    let payload = ContentPayload::Menu(MenuItem {
        name: "Margherita".to_string(),
        description: "Classic pizza".to_string(),
        category: Some("Pizza".to_string()),
        price: Some(12.5),
        extra: BTreeMap::new(),
    });

    let first = payload.embedding_text();
    let second = payload.embedding_text();
    assert_eq!(first, second);
    assert_eq!(first, "Margherita. Classic pizza. Category: Pizza. Price: 12.50");
}

#[test]
fn embedding_text_skips_empty_fields() {
    let payload = ContentPayload::Business(BusinessProfile {
        name: "Luigi's".to_string(),
        description: String::new(),
        hours: Some("  ".to_string()),
        extra: BTreeMap::new(),
    });

    assert_eq!(payload.embedding_text(), "Luigi's");
}

#[test]
fn faq_embedding_text_pairs_question_and_answer() {
    let payload = ContentPayload::Faq(FaqEntry {
        question: "Do you deliver?".to_string(),
        answer: "Yes, within 5 km.".to_string(),
        extra: BTreeMap::new(),
    });

    assert_eq!(
        payload.embedding_text(),
        "Q: Do you deliver? A: Yes, within 5 km."
    );
}

#[test]
fn title_from_metadata_reads_per_type_field() {
    let menu_meta = json!({"type": "MENU", "name": "Margherita"});
    assert_eq!(
        title_from_metadata(ContentType::Menu, &menu_meta, "item-1"),
        "Margherita"
    );

    let faq_meta = json!({"type": "FAQ", "question": "Do you deliver?"});
    assert_eq!(
        title_from_metadata(ContentType::Faq, &faq_meta, "faq-1"),
        "Do you deliver?"
    );
}

#[test]
fn title_from_metadata_falls_back_to_content_id() {
    let empty = json!({});
    assert_eq!(
        title_from_metadata(ContentType::Policy, &empty, "policy-7"),
        "policy-7"
    );

    let blank = json!({"title": "   "});
    assert_eq!(
        title_from_metadata(ContentType::Policy, &blank, "policy-7"),
        "policy-7"
    );
}

//! Parsing model answers for the built-in step kinds.

use tet_workflow::output_parser::{
    parse_candidate_index, strip_think_tags, OutputSchema, ParseError, ParseStrategy,
    ParsedOutput, ParserRegistry, EDITOR_REVIEW, EVALUATION, INITIAL_TRANSLATION,
    TRANSLATOR_REVISION,
};

#[test]
fn initial_translation_with_prose_and_thinking() {
    let raw = "<think>\nThe second line is about frost.\n</think>\n\
               Here is my translation.\n\
               <translated_poem_title>Quiet Night Thought</translated_poem_title>\n\
               <initial_translation>\nBefore my bed the moonlight glows,\nlike frost upon the ground.\n</initial_translation>\n\
               <initial_translation_notes>Rhymed loosely.</initial_translation_notes>";
    let parsed = ParserRegistry::with_builtins()
        .parse(INITIAL_TRANSLATION, raw)
        .unwrap();

    assert_eq!(parsed.strategy, ParseStrategy::Strict);
    assert_eq!(
        parsed.fields["initial_translation"],
        "Before my bed the moonlight glows,\nlike frost upon the ground."
    );
    assert_eq!(parsed.fields["translated_poem_title"], "Quiet Night Thought");
    assert!(!parsed.fields.contains_key("translated_poet_name"));
    assert_eq!(
        parsed.thinking.as_deref().map(str::trim),
        Some("The second line is about frost.")
    );
}

#[test]
fn unclosed_section_falls_back() {
    let raw = "<revised_translation>Moonlight, frost.\n\
               <revised_translation_notes>Tightened the rhythm.</revised_translation_notes>";
    let parsed = ParserRegistry::with_builtins()
        .parse(TRANSLATOR_REVISION, raw)
        .unwrap();
    assert_eq!(parsed.strategy, ParseStrategy::Fallback);
    assert_eq!(parsed.fields["revised_translation"], "Moonlight, frost.");
    assert_eq!(parsed.fields["revised_translation_notes"], "Tightened the rhythm.");
}

#[test]
fn mixed_case_tags_are_recovered() {
    let raw = "<Editor_Suggestions>1. Keep the frost.</Editor_Suggestions>";
    let parsed = ParserRegistry::with_builtins()
        .parse(EDITOR_REVIEW, raw)
        .unwrap();
    assert_eq!(parsed.fields["editor_suggestions"], "1. Keep the frost.");
}

#[test]
fn missing_required_section_is_reported() {
    let raw = "<initial_translation>Moonlight</initial_translation>";
    let err = ParserRegistry::with_builtins()
        .parse(INITIAL_TRANSLATION, raw)
        .unwrap_err();
    match err {
        ParseError::MissingFields { fields } => {
            assert_eq!(fields, vec!["initial_translation_notes".to_string()]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn empty_section_counts_as_missing() {
    let raw = "<editor_suggestions>   </editor_suggestions>";
    assert!(ParserRegistry::with_builtins()
        .parse(EDITOR_REVIEW, raw)
        .is_err());
}

#[test]
fn think_only_answer_is_empty() {
    let err = ParserRegistry::with_builtins()
        .parse(EDITOR_REVIEW, "<think>hmm</think>")
        .unwrap_err();
    assert!(matches!(err, ParseError::EmptyResponse));
}

#[test]
fn unknown_kind() {
    let err = ParserRegistry::with_builtins()
        .parse("limerick", "<x>y</x>")
        .unwrap_err();
    assert!(matches!(err, ParseError::UnknownKind(_)));
}

#[test]
fn evaluation_accepts_prose() {
    let parsed = ParserRegistry::with_builtins()
        .parse(EVALUATION, "I prefer the second one.")
        .unwrap();
    assert!(parsed.fields.is_empty());
}

#[test]
fn new_kinds_are_registered_data() {
    let registry = ParserRegistry::with_builtins()
        .with(OutputSchema::tagged("gloss", &["gloss"], &[]))
        .with(
            OutputSchema::tagged("line_count", &["lines"], &[]).with_parser(|raw, _schema| {
                let lines = raw.lines().filter(|l| !l.trim().is_empty()).count();
                Ok(ParsedOutput {
                    fields: [("lines".to_string(), lines.to_string())].into(),
                    thinking: None,
                    strategy: ParseStrategy::Custom,
                })
            }),
        );

    assert_eq!(
        registry.parse("gloss", "<gloss>霜: frost</gloss>").unwrap().fields["gloss"],
        "霜: frost"
    );
    let counted = registry.parse("line_count", "a\n\nb\nc").unwrap();
    assert_eq!(counted.fields["lines"], "3");
    assert_eq!(counted.strategy, ParseStrategy::Custom);
}

#[test]
fn candidate_index_forms() {
    assert_eq!(parse_candidate_index("2", 3).unwrap(), 1);
    assert_eq!(parse_candidate_index("Candidate 3", 3).unwrap(), 2);
    assert_eq!(parse_candidate_index("#1", 3).unwrap(), 0);
    assert_eq!(
        parse_candidate_index("After weighing them, candidate #2 is best.", 3).unwrap(),
        1
    );
    assert!(parse_candidate_index("4", 3).is_err());
    assert!(parse_candidate_index("", 3).is_err());
}

#[test]
fn think_tags_do_not_leak_into_judgments() {
    let answer = strip_think_tags("<think>Candidate 1 is weak.</think>Candidate 2");
    assert_eq!(parse_candidate_index(&answer, 2).unwrap(), 1);
}

//! Demo: the full T-E-T workflow against a scripted mock provider.
//!
//! Three draft translations are generated in parallel, a judge picks one,
//! the editor reviews it and the translator revises. Nothing leaves the
//! machine.
//!
//! Run with: `cargo run --example mock_translation`

use rust_decimal::Decimal;
use std::sync::Arc;
use tet_workflow::{
    ExecutionContext, FnProgressSink, JsonFileSink, MockBackend, MockReply, PipelineConfig,
    Pricing, ProgressEvent, ProviderRegistry,
};

fn draft(text: &str) -> MockReply {
    MockReply::text(format!(
        "<think>Keep the frost image.</think>\n\
         <translated_poem_title>Quiet Night Thoughts</translated_poem_title>\n\
         <translated_poet_name>Li Bai</translated_poet_name>\n\
         <initial_translation>{}</initial_translation>\n\
         <initial_translation_notes>Kept the four-line shape.</initial_translation_notes>",
        text
    ))
    .with_usage(180, 90)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Three branches, then judge, editor, translator.
    let mock = MockBackend::new(vec![
        draft("Before my bed, bright moonlight;\nI wonder, is it frost on the ground?"),
        draft("Moonlight before my bed,\nlike frost upon the floor."),
        draft("Bright moon at my bedside,\nfrost on the earth, I thought."),
        MockReply::text(
            "<critique>The second keeps the hush of the original.</critique>\n\
             <best_candidate>2</best_candidate>",
        )
        .with_usage(400, 40),
        MockReply::text(
            "<editor_suggestions>1. Restore the raised and lowered head in lines 3-4.</editor_suggestions>\n\
             <overall_assessment>Spare and faithful.</overall_assessment>",
        )
        .with_usage(250, 60),
        MockReply::text(
            "<revised_translation>Moonlight before my bed,\nlike frost upon the floor.\n\
             I raise my head to the bright moon,\nlower it, and think of home.</revised_translation>\n\
             <revised_translation_notes>Added the closing couplet.</revised_translation_notes>",
        )
        .with_usage(300, 80),
    ]);

    let pricing = Pricing::new(Decimal::new(27, 2), Decimal::new(110, 2));
    let providers = ProviderRegistry::new().with_priced_provider(
        "mock",
        Arc::new(mock),
        "http://unused",
        pricing,
    );

    let out_dir = std::env::temp_dir().join("tet-workflow-demo");
    let sink = JsonFileSink::new(&out_dir).with_step_journal();

    let config = PipelineConfig::translation("mock", "mock-model", 3);
    let pipeline = config
        .builder_with(providers)
        .progress(Arc::new(FnProgressSink(|event: ProgressEvent| {
            if let Some(percent) = event.percent {
                println!("  [{}] {}%", event.step, percent);
            }
        })))
        .sink(Arc::new(sink.clone()))
        .build()?;

    let inputs = ExecutionContext::new()
        .with("original_poem", "床前明月光，疑是地上霜。\n举头望明月，低头思故乡。")
        .with("source_lang", "Chinese")
        .with("target_lang", "English");

    let run = pipeline.run(inputs).await;

    println!("Status: {:?}", run.status);
    if let Some(selection) = run.selection("initial") {
        println!(
            "Winner: branch {} (rejected {:?})",
            selection.winner, selection.rejected
        );
    }
    if let Some(text) = run.output("revise.revised_translation") {
        println!("\n{}\n", text);
    }
    println!(
        "Steps: {}, tokens: {}, cost: ${}",
        run.steps.len(),
        run.total_tokens(),
        run.total_cost()
    );
    println!("Saved to {}", sink.run_path(run.run_id).display());

    Ok(())
}

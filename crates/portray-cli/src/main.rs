use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use image::codecs::jpeg::JpegEncoder;
use portray_contracts::events::{new_run_id, EventLog};
use portray_contracts::receipts::{build_finetune_receipt, build_generation_receipt, write_receipt};
use portray_contracts::requests::{
    map_object, push_unique_warning, FineTuneRequest, GenerationRequest,
};
use portray_engine::{
    run_generation, upload_finetune, ApiConfig, FluxClient, FluxError, GeneratedPortrait,
    PollSchedule, RunEvent, ThreadSleeper,
};
use serde_json::{json, Value};

#[derive(Debug, Parser)]
#[command(name = "portray", version, about = "Fine-tuned FLUX portrait generation CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate a portrait with the fine-tuned model and save it locally.
    Generate(GenerateArgs),
    /// Upload a training archive to start a fine-tune. One shot, no polling.
    Finetune(FinetuneArgs),
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    /// Character strength, clamped to 0.5..2.0.
    #[arg(long, default_value_t = 1.2)]
    strength: f64,
    /// Aspect ratio string, forwarded verbatim (e.g. "1:1", "16:9", "21:9").
    #[arg(long, default_value = "1:1")]
    aspect_ratio: String,
    #[arg(long, default_value_t = 30)]
    steps: u32,
    /// Disable photorealistic raw mode.
    #[arg(long)]
    no_raw: bool,
    /// Override the deploy-time fine-tuned model id.
    #[arg(long)]
    finetune_id: Option<String>,
    /// Export format: jpg or png.
    #[arg(long, default_value = "jpg")]
    format: String,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct FinetuneArgs {
    /// Zip archive with the training images.
    #[arg(long)]
    archive: PathBuf,
    #[arg(long)]
    comment: String,
    /// Override the deploy-time trigger word.
    #[arg(long)]
    trigger_word: Option<String>,
    #[arg(long, default_value_t = 300)]
    iterations: u32,
    #[arg(long, default_value = "character")]
    mode: String,
    #[arg(long, default_value_t = 0.00001)]
    learning_rate: f64,
    #[arg(long, default_value_t = 32)]
    rank: u32,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
}

const JPEG_EXPORT_QUALITY: u8 = 95;

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("portray error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::Finetune(args) => run_finetune(args),
    }
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let config = ApiConfig::from_env()?;
    let format = normalize_export_format(&args.format)?;

    let mut warnings = Vec::new();
    let request = generation_request_from(&args, &config)
        .normalize(&mut warnings)
        .context("invalid generation request")?;
    if !request.starts_with_trigger(&config.trigger_word) {
        push_unique_warning(
            &mut warnings,
            format!(
                "prompt does not start with trigger word '{}'; results may drift off subject",
                config.trigger_word
            ),
        );
    }
    for warning in &warnings {
        eprintln!("warning: {warning}");
    }

    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;
    let events = event_log_for(&args.out, args.events.clone());
    events.emit(
        "run_started",
        map_object(json!({
            "mode": "generate",
            "out_dir": args.out.to_string_lossy(),
        })),
    )?;

    let client = FluxClient::new(&config);
    let outcome = run_generation(
        &client,
        &ThreadSleeper,
        PollSchedule::default(),
        &request,
        |event| narrate_run_event(&events, &event),
    );
    let portrait = match outcome {
        Ok(portrait) => portrait,
        Err(err) => {
            let event_type = match &err {
                FluxError::Timeout { .. } => "job_timed_out",
                FluxError::Failed { .. } => "job_failed",
                _ => "run_errored",
            };
            let _ = events.emit(event_type, map_object(json!({"error": err.to_string()})));
            return Err(err.into());
        }
    };

    let stamp = timestamp_millis();
    let image_path = args.out.join(format!("portrait-{stamp}.{format}"));
    save_portrait(&portrait, &image_path, format)?;

    let receipt_path = args.out.join(format!("receipt-{stamp}.json"));
    let receipt = build_generation_receipt(
        &request,
        &portrait.job_id,
        &portrait.sample_url,
        &warnings,
        &image_path,
        &receipt_path,
    );
    write_receipt(&receipt_path, &receipt)?;

    let _ = events.emit(
        "artifact_created",
        map_object(json!({
            "job_id": portrait.job_id,
            "image_path": image_path.to_string_lossy(),
            "receipt_path": receipt_path.to_string_lossy(),
        })),
    );
    let _ = events.emit("run_finished", map_object(json!({"ok": true})));

    println!("Saved {}", image_path.display());
    Ok(0)
}

fn run_finetune(args: FinetuneArgs) -> Result<i32> {
    let config = ApiConfig::from_env()?;
    if !args.archive.is_file() {
        bail!("archive not found: {}", args.archive.display());
    }
    let request = finetune_request_from(&args, &config);

    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;
    let events = event_log_for(&args.out, args.events.clone());
    events.emit(
        "run_started",
        map_object(json!({
            "mode": "finetune",
            "archive": args.archive.to_string_lossy(),
        })),
    )?;

    let client = FluxClient::new(&config);
    let outcome = upload_finetune(&client, &request, &args.archive)?;

    // Raw report, per the training workflow: status plus whatever came back.
    let body = outcome
        .body_json()
        .unwrap_or_else(|| Value::String(outcome.body.clone()));
    println!("Status: {}", outcome.status);
    println!("{}", serde_json::to_string_pretty(&body)?);
    if let Some(id) = outcome.finetune_id() {
        println!("Fine-tune job id: {id}");
    }

    let receipt_path = args
        .out
        .join(format!("finetune-receipt-{}.json", timestamp_millis()));
    write_receipt(
        &receipt_path,
        &build_finetune_receipt(&request, &args.archive, outcome.status, &body),
    )?;

    let _ = events.emit(
        "finetune_submitted",
        map_object(json!({"status": outcome.status})),
    );
    let _ = events.emit(
        "run_finished",
        map_object(json!({"ok": outcome.accepted()})),
    );

    Ok(if outcome.accepted() { 0 } else { 1 })
}

fn generation_request_from(args: &GenerateArgs, config: &ApiConfig) -> GenerationRequest {
    let finetune_id = args
        .finetune_id
        .clone()
        .unwrap_or_else(|| config.finetune_id.clone());
    let mut request = GenerationRequest::with_defaults(args.prompt.clone(), finetune_id);
    request.strength = args.strength;
    request.aspect_ratio = args.aspect_ratio.clone();
    request.steps = args.steps;
    request.raw = !args.no_raw;
    request
}

fn finetune_request_from(args: &FinetuneArgs, config: &ApiConfig) -> FineTuneRequest {
    let trigger_word = args
        .trigger_word
        .clone()
        .unwrap_or_else(|| config.trigger_word.clone());
    let mut request = FineTuneRequest::with_defaults(args.comment.clone(), trigger_word);
    request.iterations = args.iterations;
    request.mode = args.mode.clone();
    request.learning_rate = args.learning_rate;
    request.lora_rank = args.rank;
    request
}

/// Mid-run events are observational; a write failure never aborts a job
/// that is already in flight.
fn narrate_run_event(events: &EventLog, event: &RunEvent) {
    match event {
        RunEvent::Submitted { job_id } => {
            println!("Job {job_id} submitted");
            let _ = events.emit("job_submitted", map_object(json!({"job_id": job_id})));
        }
        RunEvent::StatusChecked {
            checks,
            status,
            pct,
        } => {
            println!("Generating... {pct}% ({status})");
            let _ = events.emit(
                "job_pending",
                map_object(json!({"checks": checks, "status": status, "pct": pct})),
            );
        }
        RunEvent::Ready { sample_url } => {
            println!("Generating... 100% (Ready)");
            let _ = events.emit("job_ready", map_object(json!({"sample": sample_url})));
        }
    }
}

fn event_log_for(out_dir: &Path, events_path: Option<PathBuf>) -> EventLog {
    let path = events_path.unwrap_or_else(|| out_dir.join("events.jsonl"));
    EventLog::new(path, new_run_id())
}

fn normalize_export_format(raw: &str) -> Result<&'static str> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => Ok("jpg"),
        "png" => Ok("png"),
        other => bail!("unsupported export format '{other}' (expected jpg or png)"),
    }
}

fn save_portrait(portrait: &GeneratedPortrait, path: &Path, format: &str) -> Result<()> {
    match format {
        "jpg" => {
            let file = fs::File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            let mut writer = std::io::BufWriter::new(file);
            let encoder = JpegEncoder::new_with_quality(&mut writer, JPEG_EXPORT_QUALITY);
            portrait
                .image
                .to_rgb8()
                .write_with_encoder(encoder)
                .with_context(|| format!("failed to encode {}", path.display()))?;
        }
        _ => {
            portrait
                .image
                .save(path)
                .with_context(|| format!("failed to save {}", path.display()))?;
        }
    }
    Ok(())
}

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use portray_engine::ApiConfig;

    use super::{
        event_log_for, finetune_request_from, generation_request_from, normalize_export_format,
        Cli, Command,
    };

    fn test_config() -> ApiConfig {
        ApiConfig {
            api_base: "https://api.example/v1".to_string(),
            api_key: "test-key".to_string(),
            finetune_id: "ft-deploy".to_string(),
            trigger_word: "subject_tok".to_string(),
        }
    }

    #[test]
    fn generate_args_map_onto_the_request() {
        let cli = Cli::try_parse_from([
            "portray",
            "generate",
            "--prompt",
            "subject_tok, executive headshot",
            "--aspect-ratio",
            "21:9",
            "--steps",
            "40",
            "--no-raw",
            "--out",
            "/tmp/run",
        ])
        .expect("args parse");
        let Command::Generate(args) = cli.command else {
            panic!("expected generate");
        };

        let request = generation_request_from(&args, &test_config());
        assert_eq!(request.aspect_ratio, "21:9");
        assert_eq!(request.steps, 40);
        assert!(!request.raw);
        assert_eq!(request.strength, 1.2);
        assert_eq!(request.finetune_id, "ft-deploy");
    }

    #[test]
    fn finetune_args_keep_hyperparameter_defaults() {
        let cli = Cli::try_parse_from([
            "portray",
            "finetune",
            "--archive",
            "subject.zip",
            "--comment",
            "first training run",
            "--out",
            "/tmp/run",
        ])
        .expect("args parse");
        let Command::Finetune(args) = cli.command else {
            panic!("expected finetune");
        };

        let request = finetune_request_from(&args, &test_config());
        assert_eq!(request.trigger_word, "subject_tok");
        assert_eq!(request.iterations, 300);
        assert_eq!(request.mode, "character");
        assert_eq!(request.learning_rate, 0.00001);
        assert_eq!(request.lora_rank, 32);
        assert_eq!(request.finetune_type, "full");
    }

    #[test]
    fn export_format_accepts_jpeg_aliases_only() {
        assert_eq!(normalize_export_format("jpg").unwrap(), "jpg");
        assert_eq!(normalize_export_format("JPEG").unwrap(), "jpg");
        assert_eq!(normalize_export_format("png").unwrap(), "png");
        assert!(normalize_export_format("webp").is_err());
    }

    #[test]
    fn events_default_to_the_out_dir() {
        let log = event_log_for(std::path::Path::new("/tmp/run"), None);
        assert_eq!(log.path(), std::path::Path::new("/tmp/run/events.jsonl"));

        let log = event_log_for(
            std::path::Path::new("/tmp/run"),
            Some(std::path::PathBuf::from("/tmp/elsewhere.jsonl")),
        );
        assert_eq!(log.path(), std::path::Path::new("/tmp/elsewhere.jsonl"));
    }
}

use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Context, Result};
use batchgen_contracts::batches::{Batch, BatchId, BatchStore, Tier};
use batchgen_contracts::console::{parse_intent, Intent, CONSOLE_HELP_COMMANDS};
use batchgen_contracts::events::EventWriter;
use batchgen_engine::import::load_folder;
use batchgen_engine::{
    default_generator_registry, BatchEngine, EditSession, EngineConfig, EngineContext,
    Entitlement, EnvEntitlement, FleetReport, RunControl, RunOutcome,
};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "batchgen", version, about = "Batch product-image generation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Import a folder, run every batch for one tier, then export.
    Run(RunArgs),
    /// Interactive session over the batch store.
    Console(ConsoleArgs),
    /// Print the batches a folder would produce.
    Import(ImportArgs),
}

#[derive(Debug, Clone, Args)]
struct EngineArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value = "gemini")]
    provider: String,
    #[arg(long)]
    outputs: Option<usize>,
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[command(flatten)]
    engine: EngineArgs,
    #[arg(long)]
    input: PathBuf,
    #[arg(long, default_value = "normal", value_parser = parse_tier_arg)]
    tier: Tier,
    #[arg(long)]
    prompt: Option<String>,
}

#[derive(Debug, Parser)]
struct ConsoleArgs {
    #[command(flatten)]
    engine: EngineArgs,
    #[arg(long)]
    input: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ImportArgs {
    #[arg(long)]
    input: PathBuf,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("batchgen error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("batchgen=info")),
        )
        .with_writer(io::stderr)
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_batches(args),
        Command::Console(args) => {
            run_console(args)?;
            Ok(0)
        }
        Command::Import(args) => run_import(args),
    }
}

fn parse_tier_arg(raw: &str) -> Result<Tier, String> {
    Tier::parse(raw).ok_or_else(|| format!("unknown tier {raw:?} (expected normal or pro)"))
}

fn build_engine(args: &EngineArgs) -> Result<BatchEngine> {
    let mut config = EngineConfig::from_env();
    if let Some(outputs) = args.outputs {
        config = config.with_outputs_per_batch(outputs);
    }
    let registry = default_generator_registry(&config);
    let Some(generator) = registry.get(&args.provider) else {
        bail!(
            "unknown provider {:?} (available: {})",
            args.provider,
            registry.names().join(", ")
        );
    };

    let session_id = args
        .out
        .file_name()
        .and_then(|value| value.to_str())
        .filter(|value| !value.is_empty())
        .unwrap_or("session")
        .to_string();
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let ctx = EngineContext::new(
        BatchStore::new(),
        generator,
        RunControl::new(config.outputs_per_batch),
        EventWriter::new(events_path, session_id),
    )
    .with_entitlement(Arc::new(ConsoleEntitlement::default()));
    BatchEngine::new(&args.out, ctx)
}

fn run_batches(args: RunArgs) -> Result<i32> {
    let engine = build_engine(&args.engine)?;
    let ids = engine.import_folder(&args.input)?;
    if ids.is_empty() {
        println!("No images found under {}", args.input.display());
        engine.finish()?;
        return Ok(0);
    }
    if let Some(prompt) = args.prompt.as_deref() {
        for id in &ids {
            engine.set_custom_prompt(id, Some(prompt))?;
        }
    }

    let report = engine.run_all(args.tier)?;
    print_fleet_report(&engine, &report);

    let export_dir = args.engine.out.join("export");
    let export = engine.export(&export_dir)?;
    println!(
        "Exported {} files from {} batches to {}",
        export.files.len(),
        export.batches,
        export_dir.display()
    );
    let summary = engine.finish()?;
    println!("Summary written to {}", summary.display());
    Ok(if report.failed() > 0 { 2 } else { 0 })
}

fn run_import(args: ImportArgs) -> Result<i32> {
    let batches = load_folder(&args.input)?;
    if batches.is_empty() {
        println!("No images found under {}", args.input.display());
        return Ok(0);
    }
    for (position, batch) in batches.iter().enumerate() {
        let names: Vec<&str> = batch.images.iter().map(|image| image.name.as_str()).collect();
        println!(
            "{:>3}. {} ({} images): {}",
            position + 1,
            batch.name,
            batch.images.len(),
            names.join(", ")
        );
    }
    Ok(0)
}

fn run_console(args: ConsoleArgs) -> Result<()> {
    let engine = build_engine(&args.engine)?;
    let mut console = Console::new(engine);
    if let Some(input) = args.input.as_deref() {
        console.import(input)?;
    }

    let stdin = io::stdin();
    let mut line = String::new();
    println!("Batchgen console started. Type /help for commands.");

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let intent = parse_intent(line.trim_end_matches(['\n', '\r']));
        match console.handle(&intent) {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => println!("Error: {err:#}"),
        }
    }

    console.shutdown()
}

/// Prints how to enable the pro tier; grants only if a key is already present.
#[derive(Default)]
struct ConsoleEntitlement {
    env: EnvEntitlement,
}

impl Entitlement for ConsoleEntitlement {
    fn has_entitlement(&self) -> bool {
        self.env.has_entitlement()
    }

    fn request_entitlement(&self) -> bool {
        eprintln!(
            "The pro tier needs a key with access to the pro image model. Set one of {} and restart.",
            self.env.keys().join(", ")
        );
        self.env.request_entitlement()
    }
}

struct Console {
    engine: BatchEngine,
    editor: Option<EditSession>,
    workers: Vec<JoinHandle<()>>,
}

impl Console {
    fn new(engine: BatchEngine) -> Self {
        Self {
            engine,
            editor: None,
            workers: Vec::new(),
        }
    }

    /// Returns `Ok(false)` when the session should end.
    fn handle(&mut self, intent: &Intent) -> Result<bool> {
        self.reap_workers();
        match intent.action.as_str() {
            "noop" => {}
            "quit" => return Ok(false),
            "help" => println!("Commands: {}", CONSOLE_HELP_COMMANDS.join(" ")),
            "import" => {
                let path = required(intent, "path")?;
                self.import(Path::new(path))?;
            }
            "list_batches" => self.list_batches(),
            "remove_batch" => {
                let id = self.batch_arg(intent)?;
                if self.editor.as_ref().map(EditSession::batch_id) == Some(&id) {
                    self.editor = None;
                }
                let removed = self.engine.remove_batch(&id)?;
                println!("Removed {}", removed.name);
            }
            "set_prompt" => {
                let id = self.batch_arg(intent)?;
                let batch = self.engine.set_custom_prompt(&id, intent.arg("prompt"))?;
                match batch.custom_prompt.as_deref() {
                    Some(prompt) => println!("{} prompt set to: {prompt}", batch.name),
                    None => println!("{} uses the default prompt", batch.name),
                }
            }
            "add_image" => {
                let id = self.batch_arg(intent)?;
                let path = required(intent, "path")?;
                let batch = self.engine.add_image(&id, Path::new(path))?;
                println!("{} now has {} images", batch.name, batch.images.len());
            }
            "replace_image" => {
                let id = self.batch_arg(intent)?;
                let index = position_arg(intent, "index")?;
                let path = required(intent, "path")?;
                let batch = self.engine.replace_image(&id, index, Path::new(path))?;
                println!("Replaced image {} in {}", index + 1, batch.name);
            }
            "remove_image" => {
                let id = self.batch_arg(intent)?;
                let index = position_arg(intent, "index")?;
                let batch = self.engine.remove_image(&id, index)?;
                println!("{} now has {} images", batch.name, batch.images.len());
            }
            "set_outputs" => {
                let raw = required(intent, "count")?;
                let count: usize = raw
                    .parse()
                    .with_context(|| format!("invalid output count {raw:?}"))?;
                let applied = self.engine.set_outputs_per_batch(count);
                println!("Outputs per batch set to {applied}");
            }
            "run_batch" => {
                let id = self.batch_arg(intent)?;
                let tier = tier_arg(intent)?;
                let engine = self.engine.clone();
                self.spawn_worker("batchgen-run", move || match engine.run_batch(&id, tier) {
                    Ok(outcome) => println!("{}", describe_run(&engine, &id, tier, &outcome)),
                    Err(err) => println!("Run rejected: {err}"),
                })?;
            }
            "run_all" => {
                let tier = tier_arg(intent)?;
                let engine = self.engine.clone();
                self.spawn_worker("batchgen-fleet", move || match engine.run_all(tier) {
                    Ok(report) => print_fleet_report(&engine, &report),
                    Err(err) => println!("Run all rejected: {err}"),
                })?;
            }
            "stop_batch" => {
                let id = self.batch_arg(intent)?;
                if self.engine.stop_batch(&id)? {
                    println!("Stopping after the current image");
                } else {
                    println!("That batch is not processing");
                }
            }
            "stop_all" => {
                let stopped = self.engine.emergency_stop();
                println!(
                    "Emergency stop: {} batches stopping. Use /resume to allow new runs.",
                    stopped.len()
                );
            }
            "resume" => {
                self.engine.resume();
                println!("Runs allowed again");
            }
            "open_editor" => {
                let id = self.batch_arg(intent)?;
                let tier = tier_arg(intent)?;
                let index = match intent.arg("index") {
                    Some(_) => position_arg(intent, "index")?,
                    None => 0,
                };
                let session = self.engine.open_editor(&id, tier, index)?;
                println!(
                    "Editing {} result {} ({}). Type a prompt to refine it.",
                    tier.label(),
                    index + 1,
                    batch_name(&self.engine, &id)
                );
                self.editor = Some(session);
            }
            "regenerate" => {
                let prompt = intent.prompt.as_deref().unwrap_or_default();
                let editor = self.editor_mut()?;
                editor.regenerate(prompt)?;
                println!("Refined. Undo depth {}", editor.undo_depth());
            }
            "undo" => {
                let editor = self.editor_mut()?;
                if editor.undo()? {
                    println!("Undone");
                } else {
                    println!("Nothing to undo");
                }
            }
            "redo" => {
                let editor = self.editor_mut()?;
                if editor.redo()? {
                    println!("Redone");
                } else {
                    println!("Nothing to redo");
                }
            }
            "apply_all" => {
                let editor = self.editor_mut()?;
                let image = editor.current().clone();
                let written = editor.commit(image, true)?;
                println!("Applied to {written} results");
            }
            "close_editor" => {
                if self.editor.take().is_some() {
                    println!("Editor closed");
                }
            }
            "save_result" => {
                let id = self.batch_arg(intent)?;
                let tier = tier_arg(intent)?;
                let index = position_arg(intent, "index")?;
                let dir = intent
                    .arg("dir")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| self.engine.session_dir().join("downloads"));
                let path = self.engine.save_result(&id, tier, index, &dir)?;
                println!("Saved {}", path.display());
            }
            "export" => {
                let dir = intent
                    .arg("path")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| self.engine.session_dir().join("export"));
                let report = self.engine.export(&dir)?;
                if report.files.is_empty() {
                    println!("Nothing to export yet");
                } else {
                    println!(
                        "Exported {} files from {} batches to {}",
                        report.files.len(),
                        report.batches,
                        dir.display()
                    );
                }
            }
            "unknown" => {
                let command = intent.arg("command").unwrap_or_default();
                println!("Unknown command /{command}. Type /help for commands.");
            }
            other => warn!(action = other, "unhandled console action"),
        }
        Ok(true)
    }

    fn import(&mut self, path: &Path) -> Result<()> {
        let ids = self.engine.import_folder(path)?;
        println!("Imported {} batches", ids.len());
        self.list_batches();
        Ok(())
    }

    fn list_batches(&self) {
        let batches = self.engine.store().batches();
        if batches.is_empty() {
            println!("No batches. Use /import <folder>.");
            return;
        }
        for (position, batch) in batches.iter().enumerate() {
            println!("{:>3}. {}", position + 1, describe_batch(batch));
        }
    }

    fn batch_arg(&self, intent: &Intent) -> Result<BatchId> {
        let key = required(intent, "batch")?;
        self.engine
            .find_batch(key)
            .ok_or_else(|| anyhow!("no batch matches {key:?}"))
    }

    fn editor_mut(&mut self) -> Result<&mut EditSession> {
        self.editor
            .as_mut()
            .ok_or_else(|| anyhow!("no editor open; use /edit <batch> <tier> <n>"))
    }

    fn spawn_worker<F>(&mut self, name: &str, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(job)
            .with_context(|| format!("failed to spawn {name} worker"))?;
        self.workers.push(handle);
        Ok(())
    }

    fn reap_workers(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = self
            .workers
            .drain(..)
            .partition(|handle| handle.is_finished());
        for handle in finished {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
        self.workers = running;
    }

    fn wait_for_workers(&mut self) {
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }

    /// Stops in-flight runs, waits for them, then writes the session summary.
    fn shutdown(mut self) -> Result<()> {
        self.reap_workers();
        if !self.workers.is_empty() {
            info!(workers = self.workers.len(), "stopping active runs before exit");
            self.engine.emergency_stop();
        }
        self.wait_for_workers();
        let summary = self.engine.finish()?;
        println!("Summary written to {}", summary.display());
        Ok(())
    }
}

fn required<'a>(intent: &'a Intent, key: &str) -> Result<&'a str> {
    intent
        .arg(key)
        .ok_or_else(|| anyhow!("missing <{key}> argument"))
}

fn tier_arg(intent: &Intent) -> Result<Tier> {
    match intent.arg("tier") {
        Some(raw) => parse_tier_arg(raw).map_err(|err| anyhow!(err)),
        None => Ok(Tier::Normal),
    }
}

/// 1-based position on the command line, 0-based index internally.
fn position_arg(intent: &Intent, key: &str) -> Result<usize> {
    let raw = required(intent, key)?;
    match raw.parse::<usize>() {
        Ok(position) if position >= 1 => Ok(position - 1),
        _ => bail!("<{key}> must be a positive number, got {raw:?}"),
    }
}

fn batch_name(engine: &BatchEngine, id: &BatchId) -> String {
    engine
        .store()
        .get(id)
        .map(|batch| batch.name)
        .unwrap_or_else(|| id.to_string())
}

fn describe_batch(batch: &Batch) -> String {
    let mut line = format!(
        "{} [{}] images={} normal={} pro={}",
        batch.name,
        batch.status,
        batch.images.len(),
        batch.results_normal.len(),
        batch.results_pro.len()
    );
    if let Some(tier) = batch.processing_mode {
        line.push_str(&format!(" mode={tier}"));
    }
    if batch.custom_prompt.is_some() {
        line.push_str(" prompt=custom");
    }
    if let Some(failure) = batch.error.as_ref() {
        line.push_str(&format!(" error={}", failure.message));
    }
    line
}

fn describe_run(engine: &BatchEngine, id: &BatchId, tier: Tier, outcome: &RunOutcome) -> String {
    let name = batch_name(engine, id);
    match outcome {
        RunOutcome::Completed { produced } => {
            format!("{name} ({}): completed with {produced} images", tier.label())
        }
        RunOutcome::Stopped { produced } => {
            format!("{name} ({}): stopped after {produced} images", tier.label())
        }
        RunOutcome::Failed { failure } => {
            format!("{name} ({}): failed: {}", tier.label(), failure.message)
        }
        RunOutcome::Removed { .. } => format!("{name} ({}): removed during run", tier.label()),
    }
}

fn print_fleet_report(engine: &BatchEngine, report: &FleetReport) {
    for (id, outcome) in &report.runs {
        println!("{}", describe_run(engine, id, report.tier, outcome));
    }
    for id in &report.skipped {
        println!("{}: skipped", batch_name(engine, id));
    }
    if report.halted {
        println!("Run all halted by emergency stop");
    }
    println!(
        "Run all ({}): {} completed, {} failed, {} skipped",
        report.tier.label(),
        report.completed(),
        report.failed(),
        report.skipped.len()
    );
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;

    use anyhow::Result;
    use batchgen_contracts::batches::{BatchStatus, BatchStore, Tier};
    use batchgen_contracts::console::parse_intent;
    use batchgen_contracts::events::EventWriter;
    use batchgen_engine::generation::DryrunGenerator;
    use batchgen_engine::{BatchEngine, EngineContext, RunControl};

    use super::{parse_tier_arg, position_arg, Console};

    fn console_in(dir: &std::path::Path) -> Result<Console> {
        let ctx = EngineContext::new(
            BatchStore::new(),
            Arc::new(DryrunGenerator::new()),
            RunControl::new(2),
            EventWriter::new(dir.join("events.jsonl"), "console-test"),
        );
        Ok(Console::new(BatchEngine::new(dir, ctx)?))
    }

    fn send(console: &mut Console, line: &str) -> Result<bool> {
        console.handle(&parse_intent(line))
    }

    #[test]
    fn tier_and_position_args_parse() {
        assert_eq!(parse_tier_arg("PRO"), Ok(Tier::Pro));
        assert!(parse_tier_arg("ultra").is_err());
        assert_eq!(position_arg(&parse_intent("/remove_image Cats 2"), "index").ok(), Some(1));
        assert!(position_arg(&parse_intent("/remove_image Cats 0"), "index").is_err());
    }

    #[test]
    fn console_runs_edits_and_exports() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let input = temp.path().join("input");
        fs::create_dir_all(input.join("Cats"))?;
        fs::write(input.join("Cats").join("a.png"), b"a")?;
        let session = temp.path().join("session");
        let mut console = console_in(&session)?;

        assert!(send(&mut console, &format!("/import {}", input.display()))?);
        assert!(send(&mut console, "/run Cats pro")?);
        console.wait_for_workers();

        let store = console.engine.store().clone();
        let cats = store.batches()[0].clone();
        assert_eq!(cats.status, BatchStatus::Completed);
        assert_eq!(cats.results_pro.len(), 2);

        assert!(send(&mut console, "/edit 1 pro 2")?);
        assert!(send(&mut console, "make it glossy")?);
        assert!(send(&mut console, "/apply_all")?);
        let edited = store.batches()[0].results_pro.clone();
        assert_eq!(edited[0], edited[1]);
        assert_ne!(edited[1], cats.results_pro[1]);

        assert!(send(&mut console, "/undo")?);
        assert_eq!(store.batches()[0].results_pro[1], cats.results_pro[1]);

        assert!(send(&mut console, "/export")?);
        assert!(session.join("export/Cats/Pro/Cats_2.png").exists());
        assert!(!send(&mut console, "/quit")?);
        console.shutdown()?;
        assert!(session.join("summary.json").exists());
        Ok(())
    }

    #[test]
    fn console_reports_bad_arguments_as_errors() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let mut console = console_in(temp.path())?;
        assert!(send(&mut console, "/run Nope").is_err());
        assert!(send(&mut console, "/undo").is_err());
        assert!(send(&mut console, "/outputs many").is_err());
        assert!(send(&mut console, "/outputs 3")?);
        assert_eq!(console.engine.control().outputs_per_batch(), 3);
        assert!(send(&mut console, "/frobnicate")?);
        Ok(())
    }
}

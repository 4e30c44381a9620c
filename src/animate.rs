use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde::Deserialize;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::fs;
use tokio::sync::Semaphore;
use tracing::{Level, debug, warn};
use tracing_subscriber::FmtSubscriber;

use animate_studio::{
    ApiKeyStore, AspectRatio, InputImage, KeySelector, PromptSelector, Resolution, Screen, Studio,
    VeoClient, VeoClientConfig, VeoModel,
};

#[derive(Parser, Debug)]
#[command(name = "animate")]
#[command(version)]
#[command(about = "Animate a still image with Veo")]
#[command(after_help = "EXAMPLES:
    animate portrait.jpg \"Slowly zoom in on the face and make them smile\"
    animate -a 16:9 --play beach.png \"Waves roll in as the sun sets\"
    animate -o out/cat.mp4 cat.png \"The cat yawns and stretches\"
    animate --yaml animations.yaml -j 3
    animate --select-key")]
struct Args {
    /// Starting image (JPG or PNG)
    #[arg(value_name = "IMAGE")]
    image: Option<PathBuf>,

    /// How the image should be animated
    #[arg(value_name = "PROMPT")]
    prompt: Option<String>,

    /// YAML file containing animation jobs
    #[arg(short = 'y', long)]
    yaml: Option<PathBuf>,

    /// Run only the job with this name from the YAML file
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// Output file (single mode) or directory (YAML batch)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Aspect ratio: 1:1, 9:16, 16:9
    #[arg(short = 'a', long, default_value = "1:1")]
    aspect: String,

    /// Veo model: 3.1 (default), 3.1-fast
    #[arg(short = 'm', long, default_value = "3.1")]
    model: String,

    /// Output resolution: 720p, 1080p
    #[arg(short = 'r', long, default_value = "720p")]
    resolution: String,

    /// Seconds between status checks
    #[arg(long, default_value = "5")]
    poll_interval: u64,

    /// Give up after this many seconds of waiting
    #[arg(long, default_value = "600")]
    max_wait: u64,

    /// HTTP timeout in seconds
    #[arg(short, long, default_value = "120")]
    timeout: u64,

    /// Number of parallel jobs for YAML batch mode
    #[arg(short = 'j', long, default_value = "2")]
    jobs: usize,

    /// Open the finished video in the system player
    #[arg(long)]
    play: bool,

    /// Pick a new API key before running
    #[arg(long)]
    select_key: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (no progress output)
    #[arg(short, long)]
    quiet: bool,
}

/// YAML file structure for batch animations
#[derive(Debug, Deserialize)]
struct AnimationsFile {
    animations: Vec<AnimationEntry>,
}

#[derive(Debug, Deserialize, Clone)]
struct AnimationEntry {
    name: String,
    image: String,
    prompt: String,
    aspect: Option<String>,
    output: Option<String>,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}

fn parse_aspect(aspect_str: &str) -> Result<AspectRatio> {
    AspectRatio::from_str(aspect_str).map_err(|e| anyhow::anyhow!("{}", e))
}

fn parse_model(model_str: &str) -> Result<VeoModel> {
    VeoModel::from_str(model_str).map_err(|e| anyhow::anyhow!("{}", e))
}

fn parse_resolution(resolution_str: &str) -> Result<Resolution> {
    Resolution::from_str(resolution_str).map_err(|e| anyhow::anyhow!("{}", e))
}

/// Convert a string to a file-name friendly slug
fn slugify(s: &str) -> String {
    let slug: String = s
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");

    if slug.is_empty() {
        "animation".to_string()
    } else {
        slug
    }
}

/// Generate output filename: slug(name)-hash(name+prompt).ext
fn generate_output_filename(name: &str, prompt: &str, extension: &str) -> String {
    let slug = slugify(name);
    let hash_input = format!("{}{}", name, prompt);
    let hash = blake3::hash(hash_input.as_bytes());
    let hash_prefix = &hash.to_hex()[..6];
    format!("{}-{}.{}", slug, hash_prefix, extension)
}

/// Resolve a path from the YAML file relative to the file's directory
fn resolve_relative(base: &Path, path: &str) -> PathBuf {
    let path = PathBuf::from(path);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

fn spinner(template: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template(template)
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Make sure a usable key is selected, prompting when stdin is a terminal
fn ensure_api_key(store: &ApiKeyStore, force_select: bool) -> Result<String> {
    let mut selector = PromptSelector::new(
        store.clone(),
        std::io::stdin().lock(),
        std::io::stderr(),
    );
    let mut studio = Studio::new();
    studio.check_api_key(&selector);

    if force_select || studio.screen() == Screen::KeySelection {
        if !std::io::stdin().is_terminal() {
            anyhow::bail!(
                "No API key selected. Set GEMINI_API_KEY (or GOOGLE_AI_KEY) or run `animate --select-key` in a terminal"
            );
        }
        if !studio.select_api_key(&mut selector) {
            anyhow::bail!("{}", studio.error().unwrap_or("Key selection failed"));
        }
    }

    selector
        .api_key()?
        .context("No API key available after selection")
}

/// Drop the stored key so the next run starts with key selection
fn forget_rejected_key(store: &ApiKeyStore) {
    if let Err(e) = store.remove() {
        warn!("Failed to remove rejected API key: {}", e);
    }
}

struct SingleOptions {
    image: PathBuf,
    prompt: String,
    aspect_ratio: AspectRatio,
    output: Option<PathBuf>,
    play: bool,
    quiet: bool,
}

async fn animate_single(
    client: &VeoClient,
    store: &ApiKeyStore,
    opts: SingleOptions,
) -> Result<()> {
    if !opts.image.exists() {
        anyhow::bail!("Image does not exist: {:?}", opts.image);
    }

    let mut studio = Studio::new();
    studio.check_api_key(store);
    studio.set_image(
        InputImage::from_path(&opts.image)
            .await
            .context("Failed to load image")?,
    );
    studio.set_prompt(opts.prompt.clone());
    studio.set_aspect_ratio(opts.aspect_ratio);

    let pb = (!opts.quiet).then(|| spinner("{spinner:.green} {msg}"));

    studio
        .generate(client, &mut |status: &str| {
            if let Some(pb) = &pb {
                pb.set_message(status.to_string());
            }
        })
        .await;

    let Some(video) = studio.take_video() else {
        if let Some(pb) = &pb {
            pb.finish_with_message("Generation failed!");
        }
        if studio.screen() == Screen::KeySelection {
            forget_rejected_key(store);
            anyhow::bail!(
                "{} Run `animate --select-key` to pick a key with Veo access.",
                studio.error().unwrap_or_default()
            );
        }
        anyhow::bail!("{}", studio.error().unwrap_or("Video generation failed."));
    };

    if let Some(pb) = &pb {
        pb.finish_with_message("Your animation is ready!");
    }

    let output_path = match opts.output {
        Some(path) if path.extension().is_none() => path.with_extension(video.extension()),
        Some(path) => path,
        None => PathBuf::from(generate_output_filename(
            "animation",
            &opts.prompt,
            video.extension(),
        )),
    };
    debug!("Output path: {:?}", output_path);

    video
        .save(&output_path)
        .await
        .context("Failed to write video file")?;

    if !opts.quiet {
        println!("Saved animation to {}", output_path.display());
    }

    if opts.play {
        open::that(&output_path).context("Failed to open the video player")?;
    }

    Ok(())
}

struct YamlOptions {
    yaml_path: PathBuf,
    name_filter: Option<String>,
    output_dir: PathBuf,
    default_aspect: AspectRatio,
    jobs: usize,
    quiet: bool,
}

/// Result of a single animation job
struct JobResult {
    name: String,
    success: bool,
    key_rejected: bool,
    error: Option<String>,
}

impl JobResult {
    fn failed(name: &str, error: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            success: false,
            key_rejected: false,
            error: Some(error.to_string()),
        }
    }
}

/// Set once any batch job has its key rejected; jobs still waiting for a
/// slot are skipped rather than submitted with the same key.
#[derive(Debug, Default)]
struct KeyRejection(AtomicBool);

impl KeyRejection {
    fn record(&self, result: &JobResult) {
        if result.key_rejected {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn skip(&self, name: &str) -> Option<JobResult> {
        self.0
            .load(Ordering::SeqCst)
            .then(|| JobResult::failed(name, "Skipped: API key was rejected"))
    }
}

async fn run_job(
    entry: AnimationEntry,
    client: &VeoClient,
    store: &ApiKeyStore,
    yaml_dir: &Path,
    opts: &YamlOptions,
    pb: Option<ProgressBar>,
) -> JobResult {
    let aspect_ratio = match entry.aspect.as_deref().map(parse_aspect) {
        Some(Ok(ratio)) => ratio,
        Some(Err(e)) => return JobResult::failed(&entry.name, e),
        None => opts.default_aspect,
    };

    let image_path = resolve_relative(yaml_dir, &entry.image);
    if !image_path.exists() {
        return JobResult::failed(&entry.name, format!("Image not found: {:?}", image_path));
    }
    let image = match InputImage::from_path(&image_path).await {
        Ok(image) => image,
        Err(e) => return JobResult::failed(&entry.name, e),
    };

    let mut studio = Studio::new();
    studio.check_api_key(store);
    studio.set_image(image);
    studio.set_prompt(entry.prompt.clone());
    studio.set_aspect_ratio(aspect_ratio);

    let name = entry.name.clone();
    studio
        .generate(client, &mut |status: &str| {
            if let Some(pb) = &pb {
                pb.set_message(format!("{}: {}", name, status));
            }
        })
        .await;

    let Some(video) = studio.take_video() else {
        return JobResult {
            name: entry.name,
            success: false,
            key_rejected: studio.screen() == Screen::KeySelection,
            error: studio.error().map(str::to_string),
        };
    };

    let filename = entry.output.clone().unwrap_or_else(|| {
        generate_output_filename(&entry.name, &entry.prompt, video.extension())
    });
    let output_path = opts.output_dir.join(&filename);

    match video.save(&output_path).await {
        Ok(()) => {
            if let Some(pb) = &pb {
                pb.set_message(format!("{} -> {}", entry.name, filename));
            }
            JobResult {
                name: entry.name,
                success: true,
                key_rejected: false,
                error: None,
            }
        }
        Err(e) => JobResult::failed(&entry.name, e),
    }
}

async fn animate_from_yaml(client: VeoClient, store: ApiKeyStore, opts: YamlOptions) -> Result<()> {
    let yaml_content = fs::read_to_string(&opts.yaml_path)
        .await
        .context("Failed to read YAML file")?;

    let file: AnimationsFile =
        serde_yaml::from_str(&yaml_content).context("Failed to parse YAML file")?;

    let entries: Vec<AnimationEntry> = if let Some(ref name) = opts.name_filter {
        file.animations
            .into_iter()
            .filter(|e| &e.name == name)
            .collect()
    } else {
        file.animations
    };

    if entries.is_empty() {
        if let Some(name) = opts.name_filter {
            anyhow::bail!("No animation found with name: {}", name);
        } else {
            anyhow::bail!("No animations found in YAML file");
        }
    }

    if !opts.output_dir.exists() {
        fs::create_dir_all(&opts.output_dir)
            .await
            .context("Failed to create output directory")?;
    }

    let yaml_dir = opts
        .yaml_path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));

    let total = entries.len();
    let jobs = opts.jobs.max(1);

    if !opts.quiet {
        println!(
            "Animating {} image(s) with {} parallel job(s)...\n",
            total, jobs
        );
    }

    let semaphore = Arc::new(Semaphore::new(jobs));
    let client = Arc::new(client);
    let store = Arc::new(store);
    let yaml_dir = Arc::new(yaml_dir);
    let opts = Arc::new(opts);
    let multi_progress = Arc::new(MultiProgress::new());
    let rejection = Arc::new(KeyRejection::default());

    let mut handles = Vec::new();

    for (i, entry) in entries.into_iter().enumerate() {
        let sem = Arc::clone(&semaphore);
        let client = Arc::clone(&client);
        let store = Arc::clone(&store);
        let yaml_dir = Arc::clone(&yaml_dir);
        let opts = Arc::clone(&opts);
        let mp = Arc::clone(&multi_progress);
        let rejection = Arc::clone(&rejection);

        let handle = tokio::spawn(async move {
            let _permit = match sem.acquire().await {
                Ok(permit) => permit,
                Err(e) => return JobResult::failed(&entry.name, e),
            };
            if let Some(skipped) = rejection.skip(&entry.name) {
                return skipped;
            }

            let pb = (!opts.quiet).then(|| {
                let pb = mp.add(spinner("{spinner:.green} [{pos}] {msg}"));
                pb.set_position((i + 1) as u64);
                pb.set_message(format!("Animating {}...", entry.name));
                pb
            });

            let name = entry.name.clone();
            let result = run_job(entry, &client, &store, &yaml_dir, &opts, pb.clone()).await;
            rejection.record(&result);

            if let Some(pb) = pb {
                if result.success {
                    pb.finish();
                } else {
                    pb.finish_with_message(format!("{} failed!", name));
                }
            }
            result
        });

        handles.push(handle);
    }

    let results: Vec<JobResult> = futures::future::join_all(handles)
        .await
        .into_iter()
        .filter_map(|r| r.ok())
        .collect();

    let success_count = results.iter().filter(|r| r.success).count();
    let errors: Vec<_> = results
        .iter()
        .filter(|r| !r.success)
        .map(|r| (r.name.clone(), r.error.clone().unwrap_or_default()))
        .collect();

    if results.iter().any(|r| r.key_rejected) {
        forget_rejected_key(&store);
    }

    if !opts.quiet {
        println!("\n--- Summary ---");
        println!(
            "Total: {}, Success: {}, Failed: {}",
            total,
            success_count,
            errors.len()
        );
        if !errors.is_empty() {
            println!("\nFailed animations:");
            for (name, error) in &errors {
                println!("  - {}: {}", name, error);
            }
        }
    }

    if success_count == 0 && !errors.is_empty() {
        anyhow::bail!("All animations failed");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.verbose);

    let single_mode = args.image.is_some() || args.prompt.is_some();

    if single_mode && args.yaml.is_some() {
        anyhow::bail!("Cannot use IMAGE/PROMPT and --yaml at the same time");
    }

    if args.name.is_some() && args.yaml.is_none() {
        anyhow::bail!("--name can only be used with --yaml");
    }

    if !single_mode && args.yaml.is_none() && !args.select_key {
        anyhow::bail!(
            "Either an image with a prompt or --yaml file must be provided\n\nUsage:\n  animate image.png \"your prompt here\"\n  animate --yaml animations.yaml"
        );
    }

    let aspect_ratio = parse_aspect(&args.aspect)?;
    let config = VeoClientConfig {
        timeout_secs: args.timeout,
        poll_interval_secs: args.poll_interval,
        max_wait_secs: args.max_wait,
        model: parse_model(&args.model)?,
        resolution: parse_resolution(&args.resolution)?,
    };

    let store = ApiKeyStore::open_default()?;
    let api_key = ensure_api_key(&store, args.select_key)?;

    if !single_mode && args.yaml.is_none() {
        if !args.quiet {
            println!("API key selected.");
        }
        return Ok(());
    }

    let client = VeoClient::with_config(api_key, config)
        .map_err(|e| anyhow::anyhow!("Failed to create Veo client: {}", e))?;

    if let Some(yaml_path) = args.yaml {
        if !yaml_path.exists() {
            anyhow::bail!("YAML file does not exist: {:?}", yaml_path);
        }

        let output_dir = args.output.unwrap_or_else(|| PathBuf::from("./output"));
        debug!("Output directory: {:?}", output_dir);

        animate_from_yaml(
            client,
            store,
            YamlOptions {
                yaml_path,
                name_filter: args.name,
                output_dir,
                default_aspect: aspect_ratio,
                jobs: args.jobs,
                quiet: args.quiet,
            },
        )
        .await?;
    } else {
        let image = args.image.context("An image is required with a prompt")?;
        let prompt = args
            .prompt
            .context("A prompt describing the animation is required")?;

        animate_single(
            &client,
            &store,
            SingleOptions {
                image,
                prompt,
                aspect_ratio,
                output: args.output,
                play: args.play,
                quiet: args.quiet,
            },
        )
        .await?;
    }

    Ok(())
}

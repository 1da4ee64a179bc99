use clap::Parser;
use std::path::PathBuf;

use unshield_core::{run, CancellationToken, DeprotectSettings};

#[derive(Debug, Parser)]
#[command(name = "unshield", version, about = "Warcraft III map deprotector")]
struct Args {
    /// Protected map (.w3x / .w3m).
    #[arg(long, required_unless_present = "config")]
    input: Option<PathBuf>,

    /// Where the deprotected map is written.
    #[arg(long, required_unless_present = "config")]
    output: Option<PathBuf>,

    /// JSON settings file. Flags given on the command line take precedence.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listfile corpus; defaults to the per-user data directory.
    #[arg(long)]
    listfile: Option<PathBuf>,

    #[arg(long)]
    base_files: Option<PathBuf>,

    #[arg(long)]
    work_dir: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    visual_triggers: bool,

    #[arg(long, default_value_t = false)]
    brute_force: bool,

    #[arg(long)]
    brute_force_max_length: Option<usize>,

    /// Object-data repair tool run over maps that carry SLK tables.
    #[arg(long, value_name = "EXE")]
    slk_tool: Option<PathBuf>,

    /// Also write the protection report as JSON.
    #[arg(long, value_name = "PATH")]
    report_json: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    debug: bool,
}

fn default_listfile() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("Unshield").join("listfile.txt"))
}

fn setup_logger(debug: bool) -> Result<(), fern::InitError> {
    let level = if debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {}] {}",
                chrono::Local::now().format("%H:%M:%S"),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()?;
    Ok(())
}

fn load_settings(args: &Args) -> Result<DeprotectSettings, String> {
    let mut settings = match &args.config {
        Some(path) => DeprotectSettings::load(path)
            .map_err(|e| format!("Failed to load {}: {e}", path.display()))?,
        None => DeprotectSettings::default(),
    };

    if let Some(input) = &args.input {
        settings.input_path = input.clone();
    }
    if let Some(output) = &args.output {
        settings.output_path = output.clone();
    }
    if let Some(listfile) = &args.listfile {
        settings.listfile_path = Some(listfile.clone());
    } else if settings.listfile_path.is_none() {
        settings.listfile_path = default_listfile();
    }
    if let Some(base) = &args.base_files {
        settings.base_files_path = Some(base.clone());
    }
    if let Some(work) = &args.work_dir {
        settings.work_dir = Some(work.clone());
    }
    if args.visual_triggers {
        settings.create_visual_triggers = true;
    }
    if args.brute_force {
        settings.brute_force_unknowns = true;
    }
    if let Some(max_length) = args.brute_force_max_length {
        settings.brute_force.max_length = max_length;
    }
    if let Some(tool) = &args.slk_tool {
        settings.object_data_repair_exe = Some(tool.clone());
    }
    Ok(settings)
}

fn main() {
    let args = Args::parse();
    if let Err(e) = setup_logger(args.debug) {
        eprintln!("Failed to initialise logging: {e}");
    }

    let settings = match load_settings(&args) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    let report = match run(&settings, &cancel, &|line: &str| log::info!("{line}")) {
        Ok(report) => report,
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    };

    println!("Protections found: {}", report.protections_found);
    println!("Unknown files: {}", report.unknown_file_count);
    if report.unreadable_file_count > 0 {
        println!("Unreadable files: {}", report.unreadable_file_count);
    }
    println!("New listfile entries: {}", report.new_listfile_entries_found);
    for warning in &report.warnings {
        println!("{warning}");
    }

    if let Some(path) = &args.report_json {
        let written = serde_json::to_string_pretty(&report)
            .map_err(|e| e.to_string())
            .and_then(|json| std::fs::write(path, json).map_err(|e| e.to_string()));
        if let Err(e) = written {
            eprintln!("Failed to write {}: {e}", path.display());
            std::process::exit(1);
        }
    }

    if report.critical_warning_count > 0 {
        std::process::exit(2);
    }
}

use std::{
    fmt::Write as _,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use checklist::core::{GroupBy, SortDirection, TodoGroup, TodoItem};
use checklist::format::{group_class_name, to_html, to_terminal};
use checklist::grouping::{GroupOptions, group_with};
use checklist::links::VaultLinkResolver;
use checklist::scanner::{ScanConfig, ScanOptions, ScanRequest, ScanWarning, scan_documents};
use checklist::settings::Settings;
use checklist::storage::DocumentStore;
use checklist::toggle::{FileLocks, ToggleOutcome};
use checklist::vault::{FsVault, MarkdownIndex};
use checklist::TodoIndex;
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "checklist",
    about = "Collect tagged Markdown checklists from a folder of notes",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Root folder of the notes.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    /// Settings file to use instead of `<root>/.checklist.json`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print grouped todo items.
    List(ListArgs),

    /// Flip the checkbox of the item at PATH:LINE (1-based line).
    Toggle(ToggleArgs),

    /// Rescan periodically and print the list whenever it changes.
    Watch(WatchArgs),
}

#[derive(Debug, Args, Default)]
struct FilterArgs {
    /// Tag marking todo blocks (repeatable); `*` scans every file.
    #[arg(long = "tag")]
    tags: Vec<String>,
    /// Glob of files to include (repeatable).
    #[arg(long)]
    include: Vec<String>,
    /// Also list checked items.
    #[arg(long)]
    show_checked: bool,
    /// Group by `page` or `tag`.
    #[arg(long)]
    group_by: Option<GroupBy>,
    /// Group order: a->z, z->a, new->old or old->new.
    #[arg(long)]
    sort_groups: Option<SortDirection>,
    /// Item order within a group.
    #[arg(long)]
    sort_items: Option<SortDirection>,
    /// Split each group again on the other axis.
    #[arg(long)]
    sub_groups: bool,
    /// Subgroup order.
    #[arg(long)]
    sort_sub_groups: Option<SortDirection>,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[command(flatten)]
    filter: FilterArgs,
    /// Emit JSON instead of a human-readable list.
    #[arg(long, conflicts_with = "html")]
    json: bool,
    /// Emit an HTML fragment.
    #[arg(long)]
    html: bool,
}

#[derive(Debug, Args)]
struct ToggleArgs {
    /// Item location as PATH:LINE, PATH relative to the root.
    target: String,
}

#[derive(Debug, Args)]
struct WatchArgs {
    #[command(flatten)]
    filter: FilterArgs,
    /// Seconds between rescans.
    #[arg(long, default_value_t = 2)]
    interval: u64,
    /// Stop after this many rescans.
    #[arg(long)]
    iterations: Option<usize>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = cli.verbose;
    let vault = FsVault::new(&cli.root);
    let settings = load_settings(&cli.root, cli.config.as_deref(), verbose)?;
    match cli.command {
        Commands::List(args) => handle_list(&vault, settings, args, verbose),
        Commands::Toggle(args) => handle_toggle(&vault, settings, args, verbose),
        Commands::Watch(args) => handle_watch(&vault, settings, args, verbose),
    }
}

fn load_settings(root: &Path, config: Option<&Path>, verbose: bool) -> Result<Settings> {
    let settings = match config {
        Some(path) => Settings::load(path)?,
        None => Settings::discover(root)?,
    };
    if verbose {
        eprintln!("Settings: {}", serde_json::to_string(&settings)?);
    }
    Ok(settings)
}

fn apply_filter(mut settings: Settings, filter: FilterArgs) -> Settings {
    if !filter.tags.is_empty() {
        settings.todo_tags = filter.tags;
    }
    if !filter.include.is_empty() {
        settings.include_files = filter.include.join("\n");
    }
    settings.show_checked |= filter.show_checked;
    settings.sub_groups |= filter.sub_groups;
    if let Some(group_by) = filter.group_by {
        settings.group_by = group_by;
    }
    if let Some(dir) = filter.sort_groups {
        settings.sort_direction_groups = dir;
    }
    if let Some(dir) = filter.sort_items {
        settings.sort_direction_items = dir;
    }
    if let Some(dir) = filter.sort_sub_groups {
        settings.sort_direction_sub_groups = dir;
    }
    settings
}

fn report_warnings(warnings: &[ScanWarning]) {
    for w in warnings {
        if w.path.is_empty() {
            eprintln!("warning: {}", w.message);
        } else {
            eprintln!("warning: {}: {}", w.path, w.message);
        }
    }
}

fn handle_list(vault: &FsVault, settings: Settings, args: ListArgs, verbose: bool) -> Result<()> {
    let ListArgs { filter, json, html } = args;
    let settings = apply_filter(settings, filter);

    let mut index = TodoIndex::new();
    let summary = index.refresh(vault, &MarkdownIndex, &settings, &ScanOptions::with_verbose(verbose))?;
    report_warnings(&summary.warnings);

    let groups = group_with(&index.items(), GroupOptions::from(&settings));
    if groups.is_empty() && !json {
        eprintln!("No todo items found under {:?}.", vault.root());
        return Ok(());
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&groups)?);
    } else if html {
        print!("{}", render_html(&groups));
    } else {
        print!("{}", render_text(&groups));
    }
    Ok(())
}

fn handle_toggle(vault: &FsVault, settings: Settings, args: ToggleArgs, verbose: bool) -> Result<()> {
    let (path, line) = parse_target(&args.target)?;
    let settings = Settings {
        show_checked: true,
        ..settings
    };
    let config = ScanConfig::from_settings(&settings)?;

    let docs = vault.documents()?;
    if !docs.iter().any(|d| d.path == path) {
        bail!("{:?} is not a Markdown file under {:?}", path, vault.root());
    }
    let resolver = VaultLinkResolver::new(&docs);
    let request = ScanRequest {
        files: Some(vec![path.clone()]),
        modified_since: None,
    };
    let report = scan_documents(
        &docs,
        vault,
        &MarkdownIndex,
        &resolver,
        &config,
        &request,
        &ScanOptions::with_verbose(verbose),
    );
    report_warnings(&report.warnings);

    let mut item = report
        .items()
        .into_iter()
        .find(|item| item.line == line)
        .with_context(|| format!("no todo item at {}:{}", path, line + 1))?;

    let locks = FileLocks::default();
    match locks.toggle(&mut item, vault)? {
        ToggleOutcome::Toggled { checked } => {
            let mark = if checked { "x" } else { " " };
            println!("[{mark}] {}:{} {}", path, line + 1, to_terminal(&item.display));
        }
        ToggleOutcome::Stale => {
            eprintln!("{}:{} changed on disk; nothing written.", path, line + 1);
        }
    }
    Ok(())
}

fn handle_watch(vault: &FsVault, settings: Settings, args: WatchArgs, verbose: bool) -> Result<()> {
    let WatchArgs {
        filter,
        interval,
        iterations,
    } = args;
    let settings = apply_filter(settings, filter);
    let options = ScanOptions::with_verbose(verbose);

    let mut index = TodoIndex::new();
    let mut round = 0;
    loop {
        let summary = index.refresh(vault, &MarkdownIndex, &settings, &options)?;
        report_warnings(&summary.warnings);
        if summary.changed() {
            if verbose {
                eprintln!(
                    "Rescanned {} document(s), {} removed",
                    summary.scanned, summary.removed
                );
            }
            print!("{}", render_text(&index.groups(&settings)));
            println!();
        }

        round += 1;
        if iterations.is_some_and(|n| round >= n) {
            return Ok(());
        }
        thread::sleep(Duration::from_secs(interval));
    }
}

/// Parse `PATH:LINE` with a 1-based line into a path and 0-based line.
fn parse_target(target: &str) -> Result<(String, usize)> {
    let (path, line) = target
        .rsplit_once(':')
        .with_context(|| format!("expected PATH:LINE, got {:?}", target))?;
    let line: usize = line
        .parse()
        .with_context(|| format!("invalid line number {:?}", line))?;
    if path.is_empty() || line == 0 {
        bail!("expected PATH:LINE with a line number from 1, got {:?}", target);
    }
    Ok((path.trim_start_matches("./").to_string(), line - 1))
}

fn render_item(out: &mut String, item: &TodoItem, depth: usize) {
    let mark = if item.checked { "x" } else { " " };
    let _ = writeln!(
        out,
        "{}{}- [{}] {}  ({}:{})",
        "  ".repeat(depth),
        " ".repeat(item.indent_spaces),
        mark,
        to_terminal(&item.display),
        item.file_path,
        item.line + 1
    );
}

fn render_text(groups: &[TodoGroup]) -> String {
    let mut out = String::new();
    for (idx, group) in groups.iter().enumerate() {
        if idx > 0 {
            out.push('\n');
        }
        let _ = writeln!(out, "== {} ==", group.display_name);
        match &group.subgroups {
            Some(subgroups) => {
                for sub in subgroups {
                    let _ = writeln!(out, "  -- {} --", sub.display_name);
                    for item in &sub.todos {
                        render_item(&mut out, item, 2);
                    }
                }
            }
            None => {
                for item in &group.todos {
                    render_item(&mut out, item, 1);
                }
            }
        }
    }
    out
}

fn render_html_items(out: &mut String, todos: &[TodoItem]) {
    out.push_str("<ul class=\"contains-task-list\">\n");
    for item in todos {
        let _ = writeln!(
            out,
            "<li class=\"task-list-item{}\" data-line=\"{}\" style=\"margin-left: {}ch\"><input type=\"checkbox\"{} /> {}</li>",
            if item.checked { " is-checked" } else { "" },
            item.line,
            item.indent_spaces,
            if item.checked { " checked" } else { "" },
            to_html(&item.display)
        );
    }
    out.push_str("</ul>\n");
}

fn render_html(groups: &[TodoGroup]) -> String {
    let mut out = String::new();
    for group in groups {
        let _ = writeln!(
            out,
            "<section class=\"todo-group {}\">",
            group_class_name(&group.sort_name)
        );
        let _ = writeln!(
            out,
            "<h2>{}</h2>",
            checklist::format::escape(&group.display_name)
        );
        match &group.subgroups {
            Some(subgroups) => {
                for sub in subgroups {
                    let _ = writeln!(out, "<h3>{}</h3>", checklist::format::escape(&sub.display_name));
                    render_html_items(&mut out, &sub.todos);
                }
            }
            None => render_html_items(&mut out, &group.todos),
        }
        out.push_str("</section>\n");
    }
    out
}

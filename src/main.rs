use std::{
    collections::{BTreeSet, HashSet},
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chatdoc::core::{DocType, Document, Role};
use chatdoc::parser::MarkdownDocumentParser;
use chatdoc::projectors::reference_index;
use chatdoc::serialize_document;
use chatdoc::storage::{DocumentParser, DocumentStore, FsDocumentStore};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::debug;

#[derive(Debug, Parser)]
#[command(
    name = "chatdoc",
    about = "Chat document tooling built on the chatdoc crate",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse a chat document and print its structure.
    Parse(ParseArgs),

    /// Re-serialize a chat document in canonical form.
    Format(FormatArgs),

    /// Create a fresh chat document.
    New(NewArgs),

    /// Append a message to a chat document.
    Append(AppendArgs),

    /// List every path cited across one or more documents.
    Refs(RefsArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Chat documents or directories containing them.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of a debug representation.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct FormatArgs {
    /// Chat documents or directories to format.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

#[derive(Debug, Args)]
struct NewArgs {
    /// Path of the document to create.
    path: PathBuf,
    /// Document title.
    #[arg(long, default_value = "New Chat")]
    title: String,
    /// Document type.
    #[arg(long, value_enum, default_value_t = DocTypeArg::Chat)]
    doc_type: DocTypeArg,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum DocTypeArg {
    Chat,
    Flow,
}

impl From<DocTypeArg> for DocType {
    fn from(value: DocTypeArg) -> Self {
        match value {
            DocTypeArg::Chat => DocType::Chat,
            DocTypeArg::Flow => DocType::Flow,
        }
    }
}

#[derive(Debug, Args)]
struct AppendArgs {
    /// Document to modify.
    file: PathBuf,
    /// Message body.
    content: String,
    /// Message role.
    #[arg(long, value_enum, default_value_t = RoleArg::User)]
    role: RoleArg,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum RoleArg {
    User,
    System,
    Agent,
}

impl From<RoleArg> for Role {
    fn from(value: RoleArg) -> Self {
        match value {
            RoleArg::User => Role::User,
            RoleArg::System => Role::System,
            RoleArg::Agent => Role::Agent,
        }
    }
}

#[derive(Debug, Args)]
struct RefsArgs {
    /// Chat documents or directories to index.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    match cli.command {
        Commands::Parse(args) => handle_parse(args),
        Commands::Format(args) => handle_format(args),
        Commands::New(args) => handle_new(args),
        Commands::Append(args) => handle_append(args),
        Commands::Refs(args) => handle_refs(args),
    }
}

fn handle_parse(args: ParseArgs) -> Result<()> {
    let ParseArgs { inputs, json } = args;
    let expanded = expand_inputs(&inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no chat documents found in the provided inputs");
    }

    let parser = MarkdownDocumentParser;
    let mut parsed = Vec::new();
    for path in expanded {
        debug!("parsing {:?}", path);
        let doc = parser
            .parse_file(&path)
            .with_context(|| format!("parsing {:?}", path))?;
        parsed.push((path, doc));
    }

    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            path: String,
            document: &'a Document,
        }

        let payload: Vec<JsonOutput<'_>> = parsed
            .iter()
            .map(|(path, doc)| JsonOutput {
                path: path.display().to_string(),
                document: doc,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (idx, (path, doc)) in parsed.iter().enumerate() {
            if parsed.len() > 1 {
                println!("== {} ==", path.display());
            }
            println!("{:#?}", doc);
            if parsed.len() > 1 && idx + 1 < parsed.len() {
                println!();
            }
        }
    }
    Ok(())
}

fn handle_format(args: FormatArgs) -> Result<()> {
    let FormatArgs { inputs, in_place } = args;
    let expanded = expand_inputs(&inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no chat documents found in the provided inputs");
    }

    let parser = MarkdownDocumentParser;
    let mut first = true;

    for path in expanded {
        debug!("formatting {:?}", path);
        let doc = parser
            .parse_file(&path)
            .with_context(|| format!("parsing {:?}", path))?;
        let formatted =
            serialize_document(&doc).with_context(|| format!("serializing {:?}", path))?;

        if in_place {
            fs::write(&path, formatted.as_bytes())
                .with_context(|| format!("writing {:?}", path))?;
        } else {
            if !first {
                println!();
                println!("== {} ==", path.display());
            } else if inputs.len() > 1 {
                println!("== {} ==", path.display());
            }
            first = false;
            print!("{formatted}");
            if !formatted.ends_with('\n') {
                println!();
            }
        }
    }

    Ok(())
}

fn handle_new(args: NewArgs) -> Result<()> {
    let NewArgs {
        path,
        title,
        doc_type,
    } = args;

    if path.exists() {
        anyhow::bail!("{:?} already exists", path);
    }

    let mut doc = Document::new(Some(path.clone()));
    doc.set_title(&title);
    doc.metadata.doc_type = doc_type.into();

    let store = FsDocumentStore;
    store.save(&doc, &path)?;
    println!("Wrote new chat document to {:?}", path);
    Ok(())
}

fn handle_append(args: AppendArgs) -> Result<()> {
    let AppendArgs {
        file,
        content,
        role,
    } = args;

    let store = FsDocumentStore;
    let mut doc = store.load(&file)?;
    let id = doc.append_message(role.into(), &content);
    store.save(&doc, &file)?;
    println!("Appended message {} to {:?}", id.0, file);
    Ok(())
}

fn handle_refs(args: RefsArgs) -> Result<()> {
    let RefsArgs { inputs, json } = args;
    let expanded = expand_inputs(&inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no chat documents found in the provided inputs");
    }

    let parser = MarkdownDocumentParser;
    let mut indexed = Vec::new();
    for path in expanded {
        debug!("indexing {:?}", path);
        let doc = parser
            .parse_file(&path)
            .with_context(|| format!("parsing {:?}", path))?;
        indexed.push((path, reference_index::project(&doc)));
    }

    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            path: String,
            index: &'a reference_index::ReferenceIndex,
        }

        let payload: Vec<JsonOutput<'_>> = indexed
            .iter()
            .map(|(path, index)| JsonOutput {
                path: path.display().to_string(),
                index,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (path, index) in &indexed {
            if indexed.len() > 1 {
                println!("== {} ==", path.display());
            }
            if index.entries.is_empty() {
                println!("(no references)");
                continue;
            }
            for (cited, citations) in &index.entries {
                println!("{:>4}  {}", citations.len(), cited);
            }
        }
    }
    Ok(())
}

fn expand_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = BTreeSet::new();
    for path in paths {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        let meta = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {:?}", canonical))?;
        if meta.is_dir() {
            debug!("scanning directory {:?}", canonical);
            for file in collect_documents(&canonical)? {
                if visited.insert(file.clone()) {
                    out.push(file);
                }
            }
        } else if meta.is_file() {
            if canonical.extension().map(|ext| ext == "md").unwrap_or(false) {
                if visited.insert(canonical.clone()) {
                    out.push(canonical);
                }
            } else {
                anyhow::bail!("{:?} is not a .md file", canonical);
            }
        }
    }
    Ok(out)
}

fn collect_documents(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = HashSet::new();
    visit_dir(dir, &mut out, &mut visited)?;
    out.sort();
    out.dedup();
    Ok(out)
}

fn visit_dir(path: &Path, out: &mut Vec<PathBuf>, visited: &mut HashSet<PathBuf>) -> Result<()> {
    let canonical = fs::canonicalize(path)?;
    if !visited.insert(canonical.clone()) {
        return Ok(());
    }

    let metadata = fs::metadata(&canonical)?;
    if metadata.is_dir() {
        debug!("visiting directory {:?}", canonical);
        for entry in fs::read_dir(&canonical)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_symlink() {
                continue;
            }
            visit_dir(&entry.path(), out, visited)?;
        }
    } else if metadata.is_file() {
        if canonical.extension().map(|ext| ext == "md").unwrap_or(false) {
            debug!("found chat document {:?}", canonical);
            out.push(canonical);
        }
    }
    Ok(())
}

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use spirv_multiview::{MultiviewPatcher, PatchConfig, RelocateOptions, ToolchainConfig};

#[derive(Debug, Clone, Args)]
struct Io {
    /// Input SPIR-V module (little-endian words).
    #[arg(long)]
    input: PathBuf,

    /// Where to write the patched module.
    #[arg(long)]
    output: PathBuf,
}

#[derive(Debug, Parser)]
#[command(name = "multiview_patch")]
#[command(about = "Offline multiview patching of SPIR-V emitted by the D3D9 translation layer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the SPIRV-Tools performance passes.
    Optimize {
        #[command(flatten)]
        io: Io,
    },
    /// Declare the MultiView capability on a translated vertex shader.
    AddCapability {
        #[command(flatten)]
        io: Io,
    },
    /// Redirect matrix reads of a vertex shader to the current view's copy.
    Relocate {
        #[command(flatten)]
        io: Io,

        /// First constant-array row of the matrix.
        #[arg(long)]
        field_index: u32,

        /// Constant-array slot where the per-view data begins.
        #[arg(long)]
        base_offset: u32,

        /// Optimize the result instead of validating it.
        #[arg(long)]
        optimize: bool,
    },
    /// Print the shader flavor and its assembly text.
    Inspect {
        #[arg(long)]
        input: PathBuf,
    },
}

fn read_words(path: &Path) -> Result<Vec<u32>> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    if bytes.len() % 4 != 0 {
        bail!(
            "{} is {} bytes long, not a whole number of SPIR-V words",
            path.display(),
            bytes.len()
        );
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
        .collect())
}

fn write_words(path: &Path, words: &[u32]) -> Result<()> {
    let bytes: Vec<u8> = words.iter().flat_map(|word| word.to_le_bytes()).collect();
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let patcher = MultiviewPatcher::new(
        ToolchainConfig::from_env().context("invalid toolchain configuration")?,
        PatchConfig::from_env().context("invalid patch configuration")?,
    );

    let (io, out) = match cli.command {
        Commands::Optimize { io } => {
            let out = patcher.optimize(&read_words(&io.input)?)?;
            (io, out)
        }
        Commands::AddCapability { io } => {
            let out = patcher.add_multiview_capability(&read_words(&io.input)?)?;
            (io, out)
        }
        Commands::Relocate {
            io,
            field_index,
            base_offset,
            optimize,
        } => {
            let options = RelocateOptions {
                field_index,
                base_offset,
                optimize,
            };
            let out = patcher.relocate_multiview_data_access(&read_words(&io.input)?, options)?;
            (io, out)
        }
        Commands::Inspect { input } => {
            let words = read_words(&input)?;
            let (flavor, asm) = patcher.disassemble_classified(&words)?;
            println!("flavor: {flavor:?}");
            print!("{}", asm.to_text());
            return Ok(());
        }
    };

    write_words(&io.output, &out)?;
    tracing::info!(output = %io.output.display(), words = out.len(), "wrote patched module");
    Ok(())
}

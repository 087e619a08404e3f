//! Command-line driver for the shader code generator.
//!
//! Reads a program in the textual shader IR from a file (or stdin when the
//! path is `-`) and prints generated assembly, the binding report or one of
//! the analysis dumps.

use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;

use arbgen::codegen::compile;
use arbgen::core::CompilationSession;
use arbgen::graph::ProgramGraph;
use arbgen::structural::StructuralTree;
use arbgen::target::{default_profile, profile_by_name, profiles, Profile};
use arbgen::test_ir::parse_program;
use bumpalo::Bump;
use clap::{Parser, Subcommand};
use log::info;
use thiserror::Error;

#[derive(Parser)]
#[command(name = "arbcc")]
#[command(about = "Generate ARB vertex/fragment program assembly from shader IR", long_about = None)]
struct Cli {
    /// Target profile (arbvp1, nvvp2, arbfp1, nvfp, nvfp2); defaults per program kind
    #[arg(short, long, global = true)]
    profile: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate assembly text
    Compile {
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Write assembly here instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Print session statistics to stderr
        #[arg(long)]
        stats: bool,
    },

    /// Print the register binding report
    Bindings {
        #[arg(value_name = "FILE")]
        input: PathBuf,
    },

    /// Print the declared interface and the binding report
    Describe {
        #[arg(value_name = "FILE")]
        input: PathBuf,
    },

    /// Print the structural region tree
    Structure {
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Emit Graphviz instead of the indented tree
        #[arg(long)]
        dot: bool,
    },

    /// Print the control-flow graph as Graphviz
    Graph {
        #[arg(value_name = "FILE")]
        input: PathBuf,
    },

    /// List the known profiles
    Profiles,
}

#[derive(Debug, Error)]
enum DriverError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("{path}: {message}")]
    Parse { path: String, message: String },

    #[error("Compilation error: {0}")]
    Compile(#[from] arbgen::CompileError),
}

fn read_program(input: &PathBuf) -> Result<ProgramGraph, DriverError> {
    let text = if input.as_os_str() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        fs::read_to_string(input)?
    };
    parse_program(&text).map_err(|message| DriverError::Parse {
        path: input.display().to_string(),
        message,
    })
}

fn select_profile(
    name: Option<&str>,
    graph: &ProgramGraph,
) -> Result<&'static Profile, DriverError> {
    Ok(match name {
        Some(name) => profile_by_name(name)?,
        None => default_profile(graph.kind),
    })
}

fn main() -> Result<(), DriverError> {
    env_logger::init();
    let cli = Cli::parse();
    let profile_name = cli.profile.as_deref();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);

    match cli.command {
        Commands::Compile {
            input,
            output,
            stats,
        } => {
            let graph = read_program(&input)?;
            let profile = select_profile(profile_name, &graph)?;
            info!("compiling {} for {}", input.display(), profile);
            let program = compile(&graph, profile, &session)?;
            match output {
                Some(path) => fs::write(path, program.text())?,
                None => print!("{}", program.text()),
            }
            if stats {
                eprint!("{}", session.stats());
            }
        }
        Commands::Bindings { input } => {
            let graph = read_program(&input)?;
            let profile = select_profile(profile_name, &graph)?;
            let program = compile(&graph, profile, &session)?;
            print!("{}", program.describe_bindings());
        }
        Commands::Describe { input } => {
            let graph = read_program(&input)?;
            let profile = select_profile(profile_name, &graph)?;
            let program = compile(&graph, profile, &session)?;
            print!("{}{}", program.describe_interface(), program.describe_bindings());
        }
        Commands::Structure { input, dot } => {
            let graph = read_program(&input)?;
            let tree = StructuralTree::analyze(&graph);
            if dot {
                print!("{}", tree.to_dot(&graph));
            } else {
                print!("{}", tree.describe(&graph));
            }
        }
        Commands::Graph { input } => {
            let graph = read_program(&input)?;
            print!("{}", graph.to_dot());
        }
        Commands::Profiles => {
            for profile in profiles() {
                println!("{}", profile);
            }
        }
    }

    Ok(())
}

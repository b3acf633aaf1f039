use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use tilepipe::classify::LoadInfoMap;
use tilepipe::diag::{codes, Diagnostic};
use tilepipe::id::OpId;
use tilepipe::ir::Module;
use tilepipe::pipeline::{self, PipelineError, PipelinedLoop};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum EmitStage {
    Ir,
    Schedule,
    LoadInfo,
    Json,
    BuildInfo,
}

#[derive(Parser, Debug)]
#[command(
    name = "tilepipe",
    version,
    about = "Software-pipelines annotated matmul loops: multi-buffered async copies, barriers, and wait resolution"
)]
struct Cli {
    /// Input module (JSON)
    input: Option<PathBuf>,

    /// Use a built-in kernel instead of an input file
    #[arg(long, conflicts_with = "input")]
    kernel: Option<String>,

    /// Stage count for built-in kernels
    #[arg(long, default_value_t = 3)]
    stages: u32,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Ir)]
    emit: EmitStage,

    /// Run the post-expansion passes (wait resolution, async dots)
    #[arg(long)]
    post_expansion: bool,

    /// Warps per CTA
    #[arg(long)]
    num_warps: Option<u32>,

    /// Threads per warp
    #[arg(long)]
    threads_per_warp: Option<u32>,

    /// Compute capability as major * 10 + minor
    #[arg(long)]
    compute_capability: Option<u32>,

    /// Bytes per tensor descriptor
    #[arg(long)]
    descriptor_size: Option<u32>,

    /// Alignment of descriptor scratch buffers
    #[arg(long)]
    descriptor_align: Option<u32>,

    /// Log pass progress and timing (overridden by RUST_LOG)
    #[arg(long)]
    verbose: bool,
}

#[derive(Serialize)]
struct LoopLoadInfo<'a> {
    for_op: OpId,
    num_stages: u32,
    loads: &'a LoadInfoMap,
}

fn fail(code: i32, message: impl std::fmt::Display) -> ! {
    eprintln!("tilepipe: error: {}", message);
    std::process::exit(code);
}

fn load_input(cli: &Cli) -> (Module, String) {
    if let Some(name) = &cli.kernel {
        let Some(kernel) = tilepipe::fixtures::by_name(name, cli.stages) else {
            fail(
                2,
                format!(
                    "unknown kernel `{}` (known: {})",
                    name,
                    tilepipe::fixtures::KERNEL_NAMES.join(", ")
                ),
            );
        };
        let text = serde_json::to_string(&kernel.module).unwrap_or_default();
        return (kernel.module, text);
    }
    let Some(path) = &cli.input else {
        fail(2, "no input: pass a module file or --kernel");
    };
    let text = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => fail(2, format!("{}: {}", path.display(), e)),
    };
    match serde_json::from_str::<Module>(&text) {
        Ok(m) => (m, text),
        Err(e) => fail(2, format!("{}: {}", path.display(), e)),
    }
}

fn apply_target_overrides(cli: &Cli, m: &mut Module) {
    let t = &mut m.target;
    if let Some(v) = cli.num_warps {
        t.num_warps = v;
    }
    if let Some(v) = cli.threads_per_warp {
        t.threads_per_warp = v;
    }
    if let Some(v) = cli.compute_capability {
        t.compute_capability = v;
    }
    if let Some(v) = cli.descriptor_size {
        t.descriptor_size = v;
    }
    if let Some(v) = cli.descriptor_align {
        t.descriptor_align = v;
    }
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    let (mut module, input_text) = load_input(&cli);
    apply_target_overrides(&cli, &mut module);

    if cli.emit == EmitStage::BuildInfo {
        let provenance = pipeline::compute_provenance(&input_text, &module.target);
        print!("{}", provenance.to_json());
        return;
    }

    if cli.post_expansion {
        if cli.emit == EmitStage::Schedule || cli.emit == EmitStage::LoadInfo {
            fail(2, "--emit schedule and load-info need the pre-expansion pipeline");
        }
        if let Err(e) = pipeline::run_post_expansion(&mut module) {
            fail(3, e);
        }
        emit_module(&module, cli.emit);
        return;
    }

    let mut pipelined: Vec<PipelinedLoop> = Vec::new();
    let mut had_error = false;
    for for_op in module.loops() {
        if module.num_stages(for_op).is_none() {
            continue;
        }
        match pipeline::pipeline_loop(&mut module, for_op) {
            Ok(Some(p)) => pipelined.push(p),
            Ok(None) => {
                let diag = Diagnostic::warning(for_op, "loop has a stage count but no eligible load")
                    .with_code(codes::W0100)
                    .with_hint("the loop is left as written");
                eprintln!("tilepipe: {}", diag);
            }
            Err(PipelineError::Aborted { diagnostics, .. }) => {
                for d in &diagnostics {
                    eprintln!("tilepipe: {}", d);
                }
                had_error = true;
            }
            Err(e) => fail(3, e),
        }
    }

    match cli.emit {
        EmitStage::Schedule => {
            for p in &pipelined {
                println!("loop {} ({} stages)", p.for_op, p.num_stages);
                print!("{}", p.options.schedule.render(&module));
            }
        }
        EmitStage::LoadInfo => {
            let report: Vec<LoopLoadInfo> = pipelined
                .iter()
                .map(|p| LoopLoadInfo {
                    for_op: p.for_op,
                    num_stages: p.num_stages,
                    loads: &p.load_info,
                })
                .collect();
            match serde_json::to_string_pretty(&report) {
                Ok(s) => println!("{}", s),
                Err(e) => fail(3, e),
            }
        }
        other => emit_module(&module, other),
    }

    if had_error {
        std::process::exit(1);
    }
}

fn emit_module(module: &Module, emit: EmitStage) {
    match emit {
        EmitStage::Json => match serde_json::to_string_pretty(module) {
            Ok(s) => println!("{}", s),
            Err(e) => fail(3, e),
        },
        _ => print!("{}", tilepipe::print::print_module(module)),
    }
}

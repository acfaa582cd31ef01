//! The `kuroko` driver: runs a script file, optionally disassembling the
//! module body or dumping a profiling report.

use std::process::ExitCode;

use kuroko::{CallTracer, HeapData, NoopTracer, ProfilingTracer, StdPrint, Vm, VmOptions, VmTracer};

struct Args {
    script: Option<String>,
    disassemble: bool,
    profile: bool,
    trace: bool,
    gc_stress: bool,
    heap_stats: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        script: None,
        disassemble: false,
        profile: false,
        trace: false,
        gc_stress: false,
        heap_stats: false,
    };
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--dis" => args.disassemble = true,
            "--profile" => args.profile = true,
            "--trace" => args.trace = true,
            "--gc-stress" => args.gc_stress = true,
            "--heap-stats" => args.heap_stats = true,
            other if other.starts_with("--") => return Err(format!("unknown option: {other}")),
            path => {
                if args.script.is_some() {
                    return Err("only one script file may be given".to_owned());
                }
                args.script = Some(path.to_owned());
            }
        }
    }
    Ok(args)
}

fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("kuroko: {message}");
            eprintln!("usage: kuroko [--dis] [--profile] [--trace] [--gc-stress] [--heap-stats] <script.krk>");
            return ExitCode::FAILURE;
        }
    };
    let Some(script) = args.script else {
        eprintln!("usage: kuroko [--dis] [--profile] [--trace] [--gc-stress] [--heap-stats] <script.krk>");
        return ExitCode::FAILURE;
    };
    let source = match std::fs::read_to_string(&script) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("kuroko: cannot read '{script}': {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut options = VmOptions::default();
    options.gc_stress = args.gc_stress;
    // Modules resolve relative to the script's directory first.
    if let Some(parent) = std::path::Path::new(&script).parent() {
        let dir = parent.to_string_lossy().into_owned();
        if !dir.is_empty() {
            options.module_paths.insert(0, dir);
        }
    }
    let tracer: Box<dyn VmTracer> = if args.profile {
        Box::new(ProfilingTracer::new())
    } else if args.trace {
        Box::new(CallTracer::new())
    } else {
        Box::new(NoopTracer)
    };
    let mut vm = Vm::with_io(options, Box::new(StdPrint), tracer);

    if args.disassemble {
        match vm.compile(&source, &script) {
            Ok(func) => {
                if let HeapData::Function(f) = vm.heap.get(func) {
                    print!("{}", f.chunk.disassemble("<module>", &vm.heap));
                }
                return ExitCode::SUCCESS;
            }
            Err(err) => {
                eprintln!("{err}");
                return ExitCode::FAILURE;
            }
        }
    }

    let result = vm.interpret(&source, &script);
    if args.profile || args.trace {
        let mut tracer = vm.set_tracer(Box::new(NoopTracer));
        if let Some(report) = tracer.profiling_report() {
            match serde_json::to_string_pretty(&report) {
                Ok(rendered) => eprintln!("{rendered}"),
                Err(err) => eprintln!("kuroko: failed to render profile: {err}"),
            }
        }
        if let Some(trace) = tracer.take_trace_output() {
            eprint!("{trace}");
        }
    }
    if args.heap_stats {
        match serde_json::to_string_pretty(&vm.heap.stats()) {
            Ok(rendered) => eprintln!("{rendered}"),
            Err(err) => eprintln!("kuroko: failed to render heap stats: {err}"),
        }
    }
    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

//! Script-file test harness: every `tests/scripts/*.krk` runs in a fresh
//! VM and its captured output is compared against the sidecar `.out` file.

use std::path::Path;

use kuroko::{CollectStringPrint, NoopTracer, Vm, VmOptions};

fn run_script(path: &Path) -> datatest_stable::Result<()> {
    let source = std::fs::read_to_string(path)?;
    let expected = std::fs::read_to_string(path.with_extension("out"))?;
    let (writer, handle) = CollectStringPrint::new();
    let mut vm = Vm::with_io(VmOptions::default(), Box::new(writer), Box::new(NoopTracer));
    let result = vm.interpret(&source, &path.to_string_lossy());
    let output = handle.take();
    if let Err(err) = result {
        return Err(format!("script raised: {err}\noutput so far:\n{output}").into());
    }
    if output != expected {
        return Err(format!("output mismatch\n--- expected ---\n{expected}\n--- actual ---\n{output}").into());
    }
    Ok(())
}

datatest_stable::harness!(run_script, "tests/scripts", r"^.*\.krk$");

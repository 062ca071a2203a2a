use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use factorflow_core::compiler::compile;
use factorflow_core::config::CompilerConfig;
use factorflow_core::ir::FunctionBuilder;
use factorflow_core::layout::{Array, Layout};
use factorflow_rt_native::{NativeExecutor, RunOptions, run_graph};
use logutil::{LogFormat, configure_global_logger};
use parking_lot::Mutex;
use tracing::Level;

/// Writer appending into a shared buffer.
#[derive(Debug, Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn json_logs_from_compile_and_run() {
    let captured = Captured::default();
    let writer = captured.clone();
    configure_global_logger(Level::DEBUG, LogFormat::Json, move || writer.clone());

    let mut b = FunctionBuilder::new();
    let a = b.input("a");
    let r = b.rank(a);
    b.output(r, "r");
    let config = CompilerConfig {
        input_layout: Layout::TS,
        output_layout: Layout::TS,
        ..Default::default()
    };
    let module = compile(&b.build("logged").unwrap(), config).unwrap();

    let executor = NativeExecutor::single_threaded().unwrap();
    let inputs = HashMap::from([("a".to_string(), Array::filled(vec![2, 3], 1.0f32))]);
    let mut outputs = HashMap::new();
    run_graph(&executor, &module, &inputs, 0, 2, &mut outputs, RunOptions::default()).unwrap();
    assert_eq!(&[1.0; 6], outputs["r"].data());

    // RUST_LOG overrides the default level.
    if std::env::var_os("RUST_LOG").is_none() {
        let logs = String::from_utf8(captured.0.lock().clone()).unwrap();
        assert!(logs.contains("compiled module"), "{logs}");
        assert!(logs.contains("running batch"), "{logs}");
        assert!(logs.lines().all(|l| l.starts_with('{')), "{logs}");
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use factorflow_core::compiler::compile;
use factorflow_core::config::CompilerConfig;
use factorflow_core::ir::{Function, FunctionBuilder, RollingOp};
use factorflow_core::layout::{Array, Layout};
use factorflow_error::ErrorKind;
use factorflow_rt_native::{NativeExecutor, RunOptions, StreamContext, run_graph};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn avg5() -> Function {
    let mut b = FunctionBuilder::new();
    let a = b.input("price");
    let avg = b.windowed_avg(a, 5);
    b.output(avg, "avg");
    b.build("avg5").unwrap()
}

/// Several rolling operators feeding cross-sectional ones.
fn factor() -> Function {
    let mut b = FunctionBuilder::new();
    let close = b.input("close");
    let vol = b.input("volume");
    let hi = b.rolling(RollingOp::Max, close, 4);
    let lo = b.rolling(RollingOp::Min, close, 4);
    let range = b.sub(hi, lo);
    let prev = b.back_ref(close, 1);
    let ret = b.div(close, prev);
    let rank_ret = b.rank(ret);
    let rank_vol = b.rank(vol);
    let corr = b.mul(rank_ret, rank_vol);
    let smooth = b.windowed_avg(corr, 3);
    let out = b.div(smooth, range);
    b.output(out, "factor");
    let scaled = b.scale(range);
    b.output(scaled, "scaled_range");
    b.build("factor").unwrap()
}

fn batch_ts() -> CompilerConfig {
    CompilerConfig {
        input_layout: Layout::TS,
        output_layout: Layout::TS,
        dtype: factorflow_core::layout::DataType::Float64,
        ..Default::default()
    }
}

fn stream_f64() -> CompilerConfig {
    CompilerConfig {
        dtype: factorflow_core::layout::DataType::Float64,
        ..CompilerConfig::streaming()
    }
}

#[test]
fn warm_up_rolling_average() {
    logutil::init_test();

    let module = Arc::new(compile(&avg5(), CompilerConfig::streaming()).unwrap());
    let unreliable = module.output_unreliable_count()["avg"];
    assert_eq!(4, unreliable);

    let executor = NativeExecutor::multi_threaded(2).unwrap();
    let num_stocks = 3;
    let mut ctx = StreamContext::try_new(&executor, module, num_stocks).unwrap();
    let price = ctx.query_buffer_handle("price").unwrap();
    let avg = ctx.query_buffer_handle("avg").unwrap();

    let ticks: Vec<Vec<f32>> = (0..10)
        .map(|t| (0..num_stocks).map(|s| (t * t) as f32 + s as f32 * 0.5).collect())
        .collect();

    for (t, values) in ticks.iter().enumerate() {
        ctx.push_data(price, values).unwrap();
        ctx.run().unwrap();
        let got = ctx.get_current_buffer::<f32>(avg).unwrap();

        if t < unreliable {
            assert!(got.iter().all(|v| v.is_nan()), "tick {t}: {got:?}");
            continue;
        }
        for s in 0..num_stocks {
            let sum = ticks[t - 4..=t]
                .iter()
                .fold(0.0f64, |acc, tick| acc + tick[s] as f64);
            let want = (sum / 5.0) as f32;
            assert_eq!(want, got[s], "tick {t}, stock {s}");
        }
    }
    assert_eq!(10, ctx.num_ticks());
}

#[test]
fn streaming_matches_batch() {
    let func = factor();
    let batch = compile(&func, batch_ts()).unwrap();
    let stream = Arc::new(compile(&func, stream_f64()).unwrap());
    assert_eq!(batch.output_unreliable_count(), stream.output_unreliable_count());

    let (num_time, num_stocks) = (25, 13);
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let mut gen_input = || {
        let data: Vec<f64> = (0..num_time * num_stocks)
            .map(|_| rng.random_range(1.0..2.0))
            .collect();
        Array::try_new(vec![num_time, num_stocks], data).unwrap()
    };
    let inputs = HashMap::from([
        ("close".to_string(), gen_input()),
        ("volume".to_string(), gen_input()),
    ]);

    let executor = NativeExecutor::multi_threaded(4).unwrap();
    let mut batch_out = HashMap::new();
    run_graph(&executor, &batch, &inputs, 0, num_time, &mut batch_out, RunOptions::default())
        .unwrap();

    let mut ctx = StreamContext::try_new(&executor, stream.clone(), num_stocks).unwrap();
    let handles: Vec<_> = ["close", "volume"]
        .iter()
        .map(|name| (name.to_string(), ctx.query_buffer_handle(name).unwrap()))
        .collect();
    let out_handles: Vec<_> = stream
        .output_names()
        .map(|name| (name.to_string(), ctx.query_buffer_handle(name).unwrap()))
        .collect();

    for t in 0..num_time {
        for (name, handle) in &handles {
            let row = &inputs[name].data()[t * num_stocks..(t + 1) * num_stocks];
            ctx.push_data(*handle, row).unwrap();
        }
        ctx.run().unwrap();

        for (name, handle) in &out_handles {
            if t < stream.output_unreliable_count()[name] {
                continue;
            }
            let got = ctx.get_current_buffer::<f64>(*handle).unwrap();
            let want = &batch_out[name].data()[t * num_stocks..(t + 1) * num_stocks];
            for (g, w) in got.iter().zip(want) {
                assert!(
                    g.to_bits() == w.to_bits() || (g - w).abs() <= 1e-12,
                    "{name} at tick {t}: {g} != {w}"
                );
            }
        }
    }
}

#[test]
fn contexts_are_independent() {
    let module = Arc::new(compile(&avg5(), CompilerConfig::streaming()).unwrap());
    let executor = NativeExecutor::multi_threaded(2).unwrap();

    let mut a = StreamContext::try_new(&executor, module.clone(), 2).unwrap();
    let mut b = StreamContext::try_new(&executor, module, 2).unwrap();
    let (pa, oa) = (
        a.query_buffer_handle("price").unwrap(),
        a.query_buffer_handle("avg").unwrap(),
    );
    let (pb, ob) = (
        b.query_buffer_handle("price").unwrap(),
        b.query_buffer_handle("avg").unwrap(),
    );

    for t in 0..5 {
        a.push_data(pa, &[1.0f32, 1.0]).unwrap();
        a.run().unwrap();
        b.push_data(pb, &[t as f32, 2.0]).unwrap();
        b.run().unwrap();
    }

    assert_eq!(vec![1.0f32, 1.0], a.get_current_buffer::<f32>(oa).unwrap());
    assert_eq!(vec![2.0f32, 2.0], b.get_current_buffer::<f32>(ob).unwrap());
}

#[test]
fn missing_push_keeps_state() {
    let module = Arc::new(compile(&factor(), stream_f64()).unwrap());
    let executor = NativeExecutor::single_threaded().unwrap();
    let mut ctx = StreamContext::try_new(&executor, module, 3).unwrap();
    let close = ctx.query_buffer_handle("close").unwrap();
    let volume = ctx.query_buffer_handle("volume").unwrap();

    ctx.push_data(close, &[1.0f64, 2.0, 3.0]).unwrap();
    let err = ctx.run().unwrap_err();
    assert_eq!(ErrorKind::StreamMisuse, err.kind());
    assert_eq!(0, ctx.num_ticks());

    ctx.push_data(volume, &[1.0f64, 2.0, 3.0]).unwrap();
    ctx.run().unwrap();
    assert_eq!(1, ctx.num_ticks());
}

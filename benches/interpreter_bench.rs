use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use ember_core::cache;
use ember_core::compiler::compile;
use ember_core::lexer::Lexer;
use ember_core::parser::Parser;
use ember_core::vm::{self, value::Value};

fn compile_src(src: &str) -> vm::Program {
    let module = Parser::new(src).unwrap().parse_module().unwrap();
    compile(&module).unwrap()
}

fn bench_lex(c: &mut Criterion) {
    let source = "function fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); }";
    c.bench_function("lex_function_decl", |b| {
        b.iter(|| Lexer::new(black_box(source)).tokenize().unwrap());
    });
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");
    let sources = [
        ("straight_line", "var a = 1; var b = 2; a + b;"),
        (
            "fib_recursive",
            "function fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } fib(10)",
        ),
        (
            "try_finally",
            "function f(){var a=1; try{throw 7}catch(e){a=e} finally{a+=1} return a} f()",
        ),
    ];
    for (name, src) in sources {
        group.bench_with_input(BenchmarkId::from_parameter(name), &src, |b, src| {
            b.iter(|| compile_src(black_box(src)));
        });
    }
    group.finish();
}

fn bench_execute(c: &mut Criterion) {
    let mut group = c.benchmark_group("execute");

    let fib = compile_src(
        "function fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } fib(15)",
    );
    group.bench_function("fib_15", |b| {
        b.iter(|| {
            let mut ctx = vm::Context::new();
            let result = vm::execute(&mut ctx, black_box(&fib), Value::undefined(), &[]).unwrap();
            black_box(result.unwrap());
        });
    });

    let for_in = compile_src("var s=0; for (var k in {a:1,b:2,c:3}) s += k; s");
    group.bench_function("for_in_small_object", |b| {
        b.iter(|| {
            let mut ctx = vm::Context::new();
            let result =
                vm::execute(&mut ctx, black_box(&for_in), Value::undefined(), &[]).unwrap();
            black_box(result.unwrap());
        });
    });

    group.finish();
}

fn bench_cache_round_trip(c: &mut Criterion) {
    let program = compile_src(
        "function fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } fib(10)",
    );
    let bytes = cache::serialize(&program, 1_700_000_000);

    c.bench_function("cache_serialize", |b| {
        b.iter(|| black_box(cache::serialize(black_box(&program), 1_700_000_000)));
    });

    c.bench_function("cache_deserialize", |b| {
        b.iter(|| black_box(cache::deserialize(black_box(&bytes)).unwrap()));
    });
}

criterion_group!(
    benches,
    bench_lex,
    bench_compile,
    bench_execute,
    bench_cache_round_trip
);
criterion_main!(benches);

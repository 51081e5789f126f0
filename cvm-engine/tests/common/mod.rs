#![allow(dead_code, unused_imports)]

use cvm::{
    Engine, EngineConfig, EngineError, EngineResult, ExceptionKind, ManagedException,
    UnrollConfig, Word, assemble_image,
};

pub fn native_unroll_supported() -> bool {
    cfg!(all(
        target_arch = "x86_64",
        any(target_os = "linux", target_os = "windows", target_os = "macos")
    ))
}

pub fn interpreted_config() -> EngineConfig {
    EngineConfig {
        unroll: UnrollConfig {
            enabled: false,
            ..UnrollConfig::default()
        },
        ..EngineConfig::default()
    }
}

pub fn unrolled_config() -> EngineConfig {
    EngineConfig {
        unroll: UnrollConfig {
            enabled: native_unroll_supported(),
            threshold: 1,
            ..UnrollConfig::default()
        },
        ..EngineConfig::default()
    }
}

pub fn engine(source: &str, config: EngineConfig) -> Engine {
    let image = assemble_image("test", source).expect("test program should assemble");
    Engine::new(image, config)
}

pub struct Both {
    pub interpreted: EngineResult<Vec<Word>>,
    pub unrolled: EngineResult<Vec<Word>>,
    pub native_entries: u64,
}

pub fn run_both(source: &str, entry: &str, args: &[Word]) -> Both {
    let interpreted = engine(source, interpreted_config()).run(entry, args);

    let unrolled_engine = engine(source, unrolled_config());
    let id = unrolled_engine
        .image()
        .find_method(entry)
        .expect("entry method should exist");
    let mut thread = unrolled_engine.thread();
    let unrolled = thread.invoke(id, args);
    Both {
        interpreted,
        unrolled,
        native_entries: thread.native_entries(),
    }
}

pub fn run_agreeing(source: &str, entry: &str, args: &[Word]) -> EngineResult<Vec<Word>> {
    let both = run_both(source, entry, args);
    assert_eq!(
        both.interpreted, both.unrolled,
        "interpreted and unrolled runs of {entry} disagree"
    );
    if native_unroll_supported() {
        assert!(both.native_entries > 0, "{entry} never entered unrolled code");
    }
    both.interpreted
}

pub fn arg(value: i32) -> Word {
    value as u32 as Word
}

pub fn int_result(result: EngineResult<Vec<Word>>) -> i32 {
    let values = result.expect("program should return normally");
    assert_eq!(values.len(), 1, "expected one return word, got {values:?}");
    values[0] as u32 as i32
}

pub fn uncaught(result: EngineResult<Vec<Word>>) -> ManagedException {
    match result {
        Err(EngineError::Uncaught(exception)) => exception,
        other => panic!("expected an uncaught exception, got {other:?}"),
    }
}

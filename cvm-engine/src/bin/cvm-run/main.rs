mod logging;

use std::io;

use cvm::{
    Encoding, Engine, EngineConfig, Image, MethodId, Word, assemble_image, disassemble, unroll,
};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

const DEFAULT_ENTRY: &str = "main";
const REPL_HEADER: &str = ".method main() -> i32 locals 8";

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliConfig {
    source: Option<String>,
    entry: String,
    args: Vec<Word>,
    disasm: bool,
    unroll_dump: bool,
    machine: String,
    no_unroll: bool,
    threshold: Option<u32>,
    encoding: Option<Encoding>,
    repl: bool,
    help: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            source: None,
            entry: DEFAULT_ENTRY.to_string(),
            args: Vec::new(),
            disasm: false,
            unroll_dump: false,
            machine: "amd64".to_string(),
            no_unroll: false,
            threshold: None,
            encoding: None,
            repl: false,
            help: false,
        }
    }
}

impl CliConfig {
    fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::from_env();
        if self.no_unroll {
            config.unroll.enabled = false;
        }
        if let Some(threshold) = self.threshold {
            config.unroll.threshold = threshold;
        }
        if let Some(encoding) = self.encoding {
            config.encoding = encoding;
        }
        config
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init()?;
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_cli_args(&args).map_err(io::Error::other)?;
    if cli.help {
        print_usage();
        return Ok(());
    }
    if cli.repl {
        return run_repl(&cli);
    }

    let Some(path) = cli.source.as_ref() else {
        return Err(Box::new(io::Error::other("missing program path")));
    };
    let text = std::fs::read_to_string(path)?;
    let image = assemble_image(path, &text)?;
    let engine = Engine::new(image, cli.engine_config());
    if cli.disasm {
        print_listing(&engine)?;
    }
    run_entry(&engine, &cli)?;
    if cli.unroll_dump {
        print_unroll_dump(&engine, &cli.machine)?;
    }
    Ok(())
}

fn parse_cli_args(args: &[String]) -> Result<CliConfig, String> {
    let mut cfg = CliConfig::default();
    if args.is_empty() {
        cfg.repl = true;
        return Ok(cfg);
    }
    let mut index = 0usize;
    while index < args.len() {
        match args[index].as_str() {
            "-h" | "--help" => {
                cfg.help = true;
                index += 1;
            }
            "--disasm" => {
                cfg.disasm = true;
                index += 1;
            }
            "--unroll-dump" => {
                cfg.unroll_dump = true;
                index += 1;
            }
            "--no-unroll" => {
                cfg.no_unroll = true;
                index += 1;
            }
            "--repl" => {
                cfg.repl = true;
                index += 1;
            }
            "--threshold" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --threshold".to_string())?;
                let value = raw
                    .parse::<u32>()
                    .map_err(|_| format!("invalid --threshold value '{raw}'"))?;
                cfg.threshold = Some(value);
                index += 2;
            }
            "--encoding" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --encoding".to_string())?;
                let encoding = Encoding::parse(raw)
                    .ok_or_else(|| format!("invalid --encoding value '{raw}'"))?;
                cfg.encoding = Some(encoding);
                index += 2;
            }
            "--machine" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --machine".to_string())?;
                if !unroll::MACHINES.contains(&raw.as_str()) {
                    return Err(format!(
                        "invalid --machine value '{raw}' (expected one of {})",
                        unroll::MACHINES.join(", ")
                    ));
                }
                cfg.machine = raw.clone();
                index += 2;
            }
            "--entry" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --entry".to_string())?;
                cfg.entry = raw.clone();
                index += 2;
            }
            "--arg" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --arg".to_string())?;
                let value = raw
                    .parse::<i64>()
                    .map_err(|_| format!("invalid --arg value '{raw}'"))?;
                cfg.args.push(value as Word);
                index += 2;
            }
            value if value.starts_with('-') => {
                return Err(format!("unknown flag '{value}'"));
            }
            path => {
                if cfg.source.is_some() {
                    return Err("multiple program paths provided".to_string());
                }
                cfg.source = Some(path.to_string());
                index += 1;
            }
        }
    }

    if cfg.repl && (cfg.source.is_some() || cfg.disasm || cfg.unroll_dump) {
        return Err("repl mode does not accept a program path or dump flags".to_string());
    }
    if !cfg.repl && !cfg.help && cfg.source.is_none() {
        return Err("missing program path".to_string());
    }
    Ok(cfg)
}

fn print_usage() {
    println!("Usage:");
    println!("  cvm-run                    (defaults to REPL)");
    println!("  cvm-run <program.cvmasm> [--entry <name>] [--arg <n>]...");
    println!("  cvm-run --repl");
    println!("  cvm-run <program.cvmasm> --disasm");
    println!("  cvm-run <program.cvmasm> --unroll-dump [--machine amd64|x86|arm|ppc]");
    println!("  cvm-run <program.cvmasm> [--no-unroll] [--threshold <n>]");
    println!("  cvm-run <program.cvmasm> [--encoding bytecode|threaded]");
    println!();
    println!("Environment: CVM_ENCODING, CVM_UNROLL, CVM_UNROLL_THRESHOLD, CVM_CACHE_SIZE, RUST_LOG");
}

fn method_ids(image: &Image) -> Vec<(MethodId, String)> {
    image
        .methods()
        .map(|method| (method.id, image.qualified_name(method.id)))
        .collect()
}

fn print_listing(engine: &Engine) -> Result<(), Box<dyn std::error::Error>> {
    let mut thread = engine.thread();
    for (id, name) in method_ids(engine.image()) {
        let code = match thread.convert(id) {
            Ok(code) => code,
            Err(err) => {
                println!("{} {}: {err}", logging::category_error(), logging::method_label(&name));
                continue;
            }
        };
        println!(
            "{} (args {}, frame {}, max stack {}, {}):",
            logging::method_label(&name),
            code.args,
            code.frame_words,
            code.max_stack,
            code.encoding.name()
        );
        print!("{}", disassemble(&code.code, code.encoding)?);
    }
    Ok(())
}

fn run_entry(engine: &Engine, cli: &CliConfig) -> Result<(), Box<dyn std::error::Error>> {
    let values = engine.run(&cli.entry, &cli.args)?;
    println!(
        "{} {} returned {}",
        logging::category_program(),
        logging::method_label(&cli.entry),
        format_words(&values)
    );
    Ok(())
}

fn print_unroll_dump(engine: &Engine, machine: &str) -> Result<(), Box<dyn std::error::Error>> {
    for (id, name) in method_ids(engine.image()) {
        let Some(code) = engine.converted(id) else {
            continue;
        };
        let dump = unroll::dump_method(machine, &code)
            .ok_or_else(|| io::Error::other(format!("unknown machine '{machine}'")))?;
        println!(
            "{} {} on {machine}: {} slots patched",
            logging::category_unroll(),
            logging::method_label(&name),
            code.unrolled_slots()
        );
        print!("{dump}");
    }
    Ok(())
}

fn format_words(values: &[Word]) -> String {
    match values {
        [] => "<void>".to_string(),
        [value] => format_word(*value),
        values => {
            let parts: Vec<String> = values.iter().map(|value| format_word(*value)).collect();
            format!("[{}]", parts.join(", "))
        }
    }
}

fn format_word(value: Word) -> String {
    if value <= u32::MAX as Word {
        (value as u32 as i32).to_string()
    } else {
        format!("{value:#x}")
    }
}

fn run_repl(cli: &CliConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("cvm REPL (assembler)");
    println!("history: up/down arrows, commands: .help, .run, .list, .clear, .quit");
    println!("lines accumulate into `main`; end it with a return before .run");
    let mut editor = DefaultEditor::new()?;
    let mut buffer: Vec<String> = Vec::new();
    loop {
        match editor.readline("cvm> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line);
                match handle_repl_command(line) {
                    Some(ReplAction::Break) => break,
                    Some(ReplAction::Clear) => buffer.clear(),
                    Some(ReplAction::List) => {
                        for (index, text) in buffer.iter().enumerate() {
                            println!("{:3}  {text}", index + 1);
                        }
                    }
                    Some(ReplAction::Run) => run_repl_buffer(&buffer, cli),
                    Some(ReplAction::Continue) => {}
                    None => buffer.push(line.to_string()),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                println!("bye");
                break;
            }
            Err(err) => {
                return Err(Box::new(io::Error::other(err.to_string())));
            }
        }
    }
    Ok(())
}

fn run_repl_buffer(buffer: &[String], cli: &CliConfig) {
    let mut source = String::new();
    if !buffer.iter().any(|line| line.starts_with(".method")) {
        source.push_str(REPL_HEADER);
        source.push('\n');
    }
    for line in buffer {
        source.push_str(line);
        source.push('\n');
    }
    let image = match assemble_image("repl", &source) {
        Ok(image) => image,
        Err(err) => {
            println!("{err}");
            return;
        }
    };
    let engine = Engine::new(image, cli.engine_config());
    match engine.run(DEFAULT_ENTRY, &[]) {
        Ok(values) => println!("=> {}", format_words(&values)),
        Err(err) => println!("runtime error: {err}"),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReplAction {
    Continue,
    Break,
    Clear,
    List,
    Run,
}

const DIRECTIVES: [&str; 6] = [".method", ".type", ".internal", ".pinvoke", ".cctor", ".catch"];

fn handle_repl_command(line: &str) -> Option<ReplAction> {
    match line {
        ".quit" | ".exit" => Some(ReplAction::Break),
        ".run" => Some(ReplAction::Run),
        ".list" => Some(ReplAction::List),
        ".clear" => Some(ReplAction::Clear),
        ".help" => {
            println!("commands:");
            println!("  .help      show commands");
            println!("  .run       assemble the buffer and run main");
            println!("  .list      show the buffer");
            println!("  .clear     empty the buffer");
            println!("  .quit      quit repl");
            println!("  .exit      quit repl");
            Some(ReplAction::Continue)
        }
        _ if DIRECTIVES.iter().any(|directive| line.starts_with(directive)) => None,
        _ if line.starts_with('.') => {
            println!("unknown command: {line}");
            Some(ReplAction::Continue)
        }
        _ => None,
    }
}

use anyhow::{bail, Context, Result as AnyResult};
use bytemap::{
    coverage::analyze,
    decode::decode_record,
    document::render,
    lint::lint,
    parse::{parse_file, ParseOptions, ParseResult, ParsedNode},
    reader::Reader,
    span::SpanGenerator,
    Grammar,
};
use clap::{arg, value_parser, ArgMatches, Command};
use std::path::PathBuf;

fn cli() -> Command {
    let grammar_arg = arg!(-g <grammar> "Grammar document to apply")
        .value_parser(value_parser!(PathBuf))
        .required(true);
    let file_arg = arg!(-f <filename> "Binary file to dump")
        .value_parser(value_parser!(PathBuf))
        .required(true);

    Command::new("dump-bytemap")
        .about("Dump binary file structure using a record grammar")
        .subcommand_required(true)
        .subcommand(
            Command::new("lint")
                .about("validate a grammar document and echo its canonical form")
                .arg(grammar_arg.clone()),
        )
        .subcommand(
            Command::new("records")
                .about("parse a file and print its records")
                .arg(grammar_arg.clone())
                .arg(file_arg.clone())
                .arg(
                    arg!(--offset [offset] "Start offset")
                        .value_parser(value_parser!(u64)),
                )
                .arg(
                    arg!(--limit [limit] "Byte limit after the start offset")
                        .value_parser(value_parser!(u64)),
                )
                .arg(
                    arg!(--"max-records" [max] "Stop after this many records")
                        .value_parser(value_parser!(u64)),
                )
                .arg(arg!(--decode "Decode payloads through the registry")),
        )
        .subcommand(
            Command::new("coverage")
                .about("print mapped/unmapped statistics and the gap table")
                .arg(grammar_arg.clone())
                .arg(file_arg.clone()),
        )
        .subcommand(
            Command::new("spans")
                .about("print overlay spans for a byte viewport")
                .arg(grammar_arg)
                .arg(file_arg)
                .arg(arg!(--start [start] "Viewport start").value_parser(value_parser!(u64)))
                .arg(arg!(--end [end] "Viewport end").value_parser(value_parser!(u64))),
        )
}

fn load_grammar(path: &PathBuf) -> AnyResult<Grammar> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read grammar {}", path.display()))?;
    let report = lint(&text);
    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
    if !report.success() {
        for error in &report.errors {
            eprintln!("error: {error}");
        }
        bail!("grammar rejected");
    }
    Ok(report.grammar.expect("grammar present on success"))
}

fn parse(grammar: &Grammar, path: &PathBuf, options: &ParseOptions) -> AnyResult<ParseResult> {
    let reader = Reader::open(path)?;
    Ok(parse_file(grammar, &reader, options))
}

fn dump_lint(path: &PathBuf) -> AnyResult<()> {
    let grammar = load_grammar(path)?;
    print!("{}", render(&grammar.to_document()));
    Ok(())
}

fn print_node(node: &ParsedNode, depth: usize) {
    let indent = "  ".repeat(depth);
    let mut line = format!(
        "{indent}{} {} [{:#x}..{:#x})",
        node.path,
        node.kind.name(),
        node.offset,
        node.offset + node.length,
    );
    if let Some(v) = &node.value {
        line.push_str(&format!(" = {}", v.display()));
    }
    if let Some(f) = &node.formatted {
        line.push_str(&format!(" ({f})"));
    }
    if node.truncated {
        line.push_str(" (truncated at EOF)");
    }
    if let Some(e) = &node.error {
        line.push_str(&format!(" !! {e}"));
    }
    println!("{line}");
    for child in &node.children {
        print_node(child, depth + 1);
    }
}

fn dump_records(m: &ArgMatches) -> AnyResult<()> {
    let grammar = load_grammar(m.get_one::<PathBuf>("grammar").unwrap())?;
    let options = ParseOptions {
        start_offset: m.get_one("offset").copied().unwrap_or(0),
        byte_limit: m.get_one("limit").copied(),
        max_records: m.get_one("max-records").copied(),
    };
    let result = parse(&grammar, m.get_one::<PathBuf>("filename").unwrap(), &options)?;

    for record in &result.records {
        let disc = record
            .discriminator
            .as_deref()
            .map(|d| format!(" {d}"))
            .unwrap_or_default();
        println!(
            "record {}{} [{:#x}..{:#x})",
            record.type_name,
            disc,
            record.offset,
            record.offset + record.size,
        );
        for node in &record.nodes {
            print_node(node, 1);
        }
        if m.get_flag("decode") {
            match decode_record(record, &grammar, None) {
                Ok(decoded) => println!("  decoded ({}): {}", decoded.decoder, decoded.value),
                Err(e) => println!("  decoded: ({e})"),
            }
        }
    }
    if !result.errors.is_empty() {
        println!("{} errors:", result.errors.len());
        for error in &result.errors {
            println!("  {error}");
        }
    }
    println!(
        "{} records, {} bytes parsed, stopped at {:#x}",
        result.record_count(),
        result.total_bytes_parsed,
        result.parse_stopped_at,
    );
    Ok(())
}

fn dump_coverage(m: &ArgMatches) -> AnyResult<()> {
    let grammar = load_grammar(m.get_one::<PathBuf>("grammar").unwrap())?;
    let path = m.get_one::<PathBuf>("filename").unwrap();
    let reader = Reader::open(path)?;
    let file_size = reader.size();
    let result = parse_file(&grammar, &reader, &ParseOptions::default());
    let report = analyze(&result, file_size);

    println!(
        "{} / {} bytes mapped ({:.1}%), {} records",
        report.bytes_covered, report.file_size, report.coverage_percentage, report.record_count,
    );
    for (start, end) in &report.gaps {
        println!("gap [{start:#x}..{end:#x}) {} bytes", end - start);
    }
    if let Some((start, end)) = report.largest_gap {
        println!("largest gap [{start:#x}..{end:#x})");
    }
    Ok(())
}

fn dump_spans(m: &ArgMatches) -> AnyResult<()> {
    let grammar = load_grammar(m.get_one::<PathBuf>("grammar").unwrap())?;
    let path = m.get_one::<PathBuf>("filename").unwrap();
    let reader = Reader::open(path)?;
    let file_size = reader.size();
    let result = parse_file(&grammar, &reader, &ParseOptions::default());

    let start = m.get_one("start").copied().unwrap_or(0);
    let end = m.get_one("end").copied().unwrap_or(file_size);
    let mut generator = SpanGenerator::new(&result);
    let set = generator.generate(start, end);
    for span in set.spans() {
        let color = span
            .color
            .as_ref()
            .map(|c| format!(" color={}", c.as_str()))
            .unwrap_or_default();
        println!(
            "[{:#x}..{:#x}) {} group={} endian={}/{}{}",
            span.offset,
            span.end(),
            span.path,
            span.group,
            span.endian,
            span.endian_source,
            color,
        );
    }
    Ok(())
}

fn main() -> AnyResult<()> {
    env_logger::init();

    match cli().get_matches().subcommand() {
        Some(("lint", m)) => dump_lint(m.get_one::<PathBuf>("grammar").unwrap()),
        Some(("records", m)) => dump_records(m),
        Some(("coverage", m)) => dump_coverage(m),
        Some(("spans", m)) => dump_spans(m),
        _ => unreachable!(),
    }
}

use clap::{Arg, ArgAction, Command};
use csv_async::AsyncWriterBuilder;

/// Deterministic charge-curve generator for battery-test CSV.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = Command::new("gen")
        .arg(
            Arg::new("cycles")
                .long("cycles")
                .value_parser(clap::value_parser!(u64))
                .required(true),
        )
        .arg(
            Arg::new("rows_per_cycle")
                .long("rows-per-cycle")
                .value_parser(clap::value_parser!(u64))
                .default_value("200"),
        )
        .arg(
            Arg::new("with_header")
                .long("with-header")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("delim")
                .long("delim")
                .help("\",\" or \"tab\"")
                .default_value(","),
        )
        .arg(
            Arg::new("dirty_every")
                .long("dirty-every")
                .help("Corrupt the Cycle field of every Nth row")
                .value_parser(clap::value_parser!(u64)),
        )
        .get_matches();

    let cycles: u64 = *matches.get_one("cycles").unwrap();
    let rows_per_cycle: u64 = *matches.get_one("rows_per_cycle").unwrap();
    let with_header = matches.get_flag("with_header");
    let delimiter = match matches.get_one::<String>("delim").unwrap().as_str() {
        "tab" | "\\t" => b'\t',
        other => *other
            .as_bytes()
            .first()
            .ok_or_else(|| anyhow::anyhow!("empty delimiter"))?,
    };
    let dirty_every = matches.get_one::<u64>("dirty_every").copied().filter(|n| *n > 0);

    let mut out = AsyncWriterBuilder::new()
        .delimiter(delimiter)
        .create_writer(tokio::io::stdout());

    if with_header {
        out.write_record(&["Cycle", "Time_Min", "Voltage", "Current", "Temp", "Capacity"])
            .await?;
    }

    let mut row_no = 0u64;
    for cycle in 1..=cycles {
        // linear capacity fade, 0.05% per cycle
        let capacity = 2.0 * (1.0 - 0.0005 * cycle as f64);
        for i in 0..rows_per_cycle {
            row_no += 1;
            let progress = i as f64 / rows_per_cycle.max(1) as f64;
            let time_min = i as f64 * 0.5;
            let voltage = 3.0 + 1.2 * progress.sqrt();
            let current = if progress < 0.8 { 1.0 } else { 1.0 - (progress - 0.8) * 4.0 };
            let temp = 25.0 + 3.0 * (progress * std::f64::consts::PI).sin();

            let cycle_field = match dirty_every {
                Some(n) if row_no % n == 0 => "bad".to_string(),
                _ => cycle.to_string(),
            };
            out.write_record(&[
                cycle_field,
                format!("{time_min:.2}"),
                format!("{voltage:.4}"),
                format!("{current:.4}"),
                format!("{temp:.2}"),
                format!("{capacity:.4}"),
            ])
            .await?;
        }
        out.flush().await?;
    }

    out.flush().await?;
    Ok(())
}

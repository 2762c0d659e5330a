//! Output formatting

use clap::ValueEnum;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

impl OutputFormat {
    /// Rows as a table, or the raw values as JSON
    pub fn print_rows<T, R>(&self, data: &[T], row: impl Fn(usize, &T) -> R)
    where
        T: Serialize,
        R: Tabled,
    {
        match self {
            OutputFormat::Json => print_json(&data),
            OutputFormat::Table => {
                if data.is_empty() {
                    println!("(none)");
                    return;
                }
                let rows: Vec<R> = data.iter().enumerate().map(|(i, item)| row(i, item)).collect();
                println!("{}", Table::new(rows).with(Style::rounded()));
            }
        }
    }

    /// A single value; tables fall back to `text`
    pub fn print_value<T: Serialize>(&self, data: &T, text: impl FnOnce() -> String) {
        match self {
            OutputFormat::Json => print_json(data),
            OutputFormat::Table => println!("{}", text()),
        }
    }
}

fn print_json<T: Serialize + ?Sized>(data: &T) {
    println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
}

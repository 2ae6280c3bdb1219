use std::env::args;
use std::str::FromStr;

use kern_synch::{logger::ConsoleLogger, synchtest};
use log::LevelFilter;
use strum::IntoEnumIterator;
use strum_macros::{self, Display, EnumIter, EnumString};

fn main() -> Result<(), String> {
    let level = args()
        .nth(2)
        .map(|l| LevelFilter::from_str(&l).map_err(|e| format!("bad log level `{l}': {e}")))
        .transpose()?
        .unwrap_or(LevelFilter::Info);
    ConsoleLogger::new(level)
        .init()
        .map_err(|e| e.to_string())?;

    args()
        .nth(1)
        .ok_or(format!(
            "no test supplied, use one of {}",
            Test::iter()
                .map(|t| t.to_string())
                .collect::<Vec<String>>()
                .join(",")
        ))
        .and_then(|selector| Test::from_str(&selector).map_err(|e| e.to_string()))
        .and_then(|test| test.run(synchtest::Config::default()))
}

#[derive(Clone, Copy, EnumIter, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
enum Test {
    Semtest,
    Locktest,
    Cvtest,
    Rwtest,
    All,
}

impl Test {
    fn run(self, config: synchtest::Config) -> Result<(), String> {
        match self {
            Test::Semtest => synchtest::semtest(config),
            Test::Locktest => synchtest::locktest(config),
            Test::Cvtest => synchtest::cvtest(config),
            Test::Rwtest => synchtest::rwtest(config),
            Test::All => Test::iter()
                .filter(|t| !matches!(t, Test::All))
                .try_for_each(|t| t.run(config)),
        }
    }
}

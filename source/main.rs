use clap::Parser as _;

#[derive(clap::Parser)]
struct Arguments {
  #[clap(flatten)]
  arguments: strainer::Arguments,
}

fn main() -> anyhow::Result<()> {
  let arguments = Arguments::parse();

  let encoder = Box::new(log4rs::encode::pattern::PatternEncoder::new(
    "{d(%F %T%.3f)} - {l} : {m}{n}",
  ));
  log4rs::init_config(
    log4rs::config::Config::builder()
      .appender(
        log4rs::config::Appender::builder()
          .filter(Box::new(log4rs::filter::threshold::ThresholdFilter::new(
            if arguments.arguments.debug {
              log::LevelFilter::Debug
            } else {
              log::LevelFilter::Info
            },
          )))
          .build(
            "console",
            Box::new(
              log4rs::append::console::ConsoleAppender::builder()
                .encoder(encoder)
                .build(),
            ),
          ),
      )
      .build(
        log4rs::config::Root::builder()
          .appenders(["console"])
          .build(log::LevelFilter::Trace),
      )?,
  )?;

  strainer::run(&arguments.arguments)
}

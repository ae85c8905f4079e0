use std::sync::Arc;
use std::time::Duration;
use std::{env, io};
use wakelight_controller::*;

const TIME_ENTITY: &str = "input_datetime.wake_time";
const LEAD_IN_ENTITY: &str = "input_number.lead_in";
const ENABLED_ENTITY: &str = "input_boolean.alarm_on";
const WEEKEND_ENTITY: &str = "input_boolean.weekends";

#[tokio::main]
async fn main() -> Result<()> {
    // Optional step override in milliseconds for accelerated testing.
    let usage = "Usage: waked [step-ms]";
    let args: Vec<_> = env::args().collect();
    if args.len() > 1 && (args[1] == "-h" || args[1] == "--help") {
        eprintln!("{usage}");
        std::process::exit(0);
    }
    let step_ms: u64 = if args.len() > 1 {
        args[1].parse().unwrap_or_else(|_| {
            eprintln!("{usage}");
            std::process::exit(1);
        })
    } else {
        60_000
    };

    // Seed the in-process store with a workable schedule
    let store = Arc::new(MemoryStore::new());
    store.set(TIME_ENTITY, "06:30:00");
    store.set(LEAD_IN_ENTITY, "30");
    store.set(ENABLED_ENTITY, "on");
    store.set(WEEKEND_ENTITY, "on");
    store.register("light.bed_left");
    store.register("light.bed_right");

    let lights = Arc::new(MemoryLights::new());

    let mut config = AlarmConfig::new(TIME_ENTITY, ["light.bed_left", "light.bed_right"]);
    config.lead_in_entity = Some(LEAD_IN_ENTITY.into());
    config.enabled_entity = Some(ENABLED_ENTITY.into());
    config.weekend_entity = Some(WEEKEND_ENTITY.into());
    config.step_interval = Duration::from_millis(step_ms);

    let alarm = SunriseAlarm::start(config, store.clone(), lights.clone(), Arc::new(SystemClock))?;

    // Inform about successful initialization
    println!("OK");

    // Mainloop: wait for user input, line by line
    loop {
        let mut input = String::new();
        if io::stdin().read_line(&mut input).expect("!!") == 0 {
            break;
        }

        let line = input.trim();
        let (cmd, arg) = match line.split_once(':') {
            Some((cmd, arg)) => (cmd, Some(arg)),
            None => (line, None),
        };

        match cmd {
            "set_time" => match arg {
                Some(raw) if chrono::NaiveTime::parse_from_str(raw, "%H:%M:%S").is_ok() => {
                    store.set(TIME_ENTITY, raw);
                    println!("OK");
                }
                Some(raw) => eprintln!("ERR Invalid time format: {raw} (use HH:MM:SS)"),
                None => eprintln!("ERR No time given"),
            },
            "set_lead_in" => match arg {
                Some(raw) if raw.trim().parse::<f64>().is_ok() => {
                    store.set(LEAD_IN_ENTITY, raw.trim());
                    println!("OK");
                }
                Some(raw) => eprintln!("ERR Invalid lead-in: {raw}"),
                None => eprintln!("ERR No lead-in given"),
            },
            "enable" => match arg {
                Some(value @ ("on" | "off")) => {
                    store.set(ENABLED_ENTITY, value);
                    println!("OK");
                }
                _ => eprintln!("ERR Use enable:on or enable:off"),
            },
            "weekends" => match arg {
                Some(value @ ("on" | "off")) => {
                    store.set(WEEKEND_ENTITY, value);
                    println!("OK");
                }
                _ => eprintln!("ERR Use weekends:on or weekends:off"),
            },
            "seed" => match arg.and_then(|a| a.split_once(',')) {
                Some((fixture, level)) => match level.trim().parse::<u8>() {
                    Ok(level) => {
                        lights.seed(fixture.trim(), level);
                        println!("OK");
                    }
                    Err(_) => eprintln!("ERR Invalid level: {level} (use 0-255)"),
                },
                None => eprintln!("ERR Use seed:<fixture>,<level>"),
            },
            "trigger" => {
                alarm.trigger_now().await;
                println!("OK");
            }
            "status" => {
                let status = alarm.status();
                println!(
                    "OK wake={} lead_in={}m trigger={} enabled={} weekends={} armed={} running={}",
                    status.wake_time,
                    status.lead_in_min,
                    status.trigger_time,
                    status.enabled,
                    status.weekends_enabled,
                    status.armed,
                    status.running,
                );
            }
            "quit" => break,
            "" => eprintln!("ERR No command given"),
            other => eprintln!("ERR Unknown command: {other}"),
        }
    }

    Ok(())
}

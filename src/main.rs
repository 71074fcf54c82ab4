use clap::*;
use clap_num::maybe_hex;
use exhume_image::bitlocker::BitLocker;
use exhume_image::Image;
use log::{error, info, LevelFilter};
use std::io::{Read, Seek, SeekFrom};

fn process_image(
    paths: &[String],
    format: &str,
    size: u64,
    offset: u64,
    bitlocker_offset: Option<u64>,
    password: Option<&str>,
    vhd_output: Option<&str>,
    json: bool,
) {
    let mut image = match Image::open(paths, format, None) {
        Ok(image) => image,
        Err(err) => {
            error!("Cannot open image: {}", err);
            std::process::exit(1);
        }
    };

    info!("Selected format: {}", image.format_name());
    image.print_info();

    if json {
        match serde_json::to_string_pretty(&image.info()) {
            Ok(text) => println!("{}", text),
            Err(err) => error!("Cannot serialize image info: {}", err),
        }
    }

    if let Some(output) = vhd_output {
        if let Err(err) = image.enable_writer(output) {
            error!("Cannot enable the image writer: {}", err);
            std::process::exit(1);
        }
    }

    let mut bytes = vec![0u8; size as usize];
    match bitlocker_offset {
        Some(volume_offset) => {
            info!(
                "Attempting BitLocker unlock at volume offset 0x{:x}...",
                volume_offset
            );
            let mut filter = match BitLocker::try_unlock(image, volume_offset, password) {
                Ok(filter) => filter,
                Err(err) => {
                    if let Some(kinds) = err.unsupported_protection_types() {
                        error!("Unsupported key protection type(s): {}", kinds);
                    }
                    error!("BitLocker unlock failed: {}", err);
                    std::process::exit(1);
                }
            };
            filter.print_info();
            if let Err(err) = filter
                .seek(SeekFrom::Start(offset))
                .and_then(|_| filter.read(&mut bytes))
            {
                error!("Cannot read the decrypted volume: {}", err);
                std::process::exit(1);
            }
            println!("{}", String::from_utf8_lossy(&bytes));

            // Give the handle back so a capture can still complete below.
            image = filter.into_inner();
        }
        None => {
            if size > 0 {
                if let Err(err) = image
                    .seek(SeekFrom::Start(offset))
                    .and_then(|_| image.read(&mut bytes))
                {
                    error!("Cannot read the image: {}", err);
                    std::process::exit(1);
                }
                println!("{}", String::from_utf8_lossy(&bytes));
            }
        }
    }

    if vhd_output.is_some() {
        info!("Completing the VHD capture...");
        match image.finish_image() {
            Ok(()) => info!("Capture finished ({}%)", image.progress()),
            Err(err) => {
                error!("VHD capture failed: {}", err);
                std::process::exit(1);
            }
        }
    }
}

fn main() {
    let matches = Command::new("exhume_image")
        .version(crate_version!())
        .author(crate_authors!())
        .about("Exhume the bytes of a disk image, decrypting and capturing on the way.")
        .arg(
            Arg::new("body")
                .short('b')
                .long("body")
                .value_parser(value_parser!(String))
                .action(ArgAction::Append)
                .required(true)
                .help("The path to the image to exhume (repeat for split segments or a QCOW2 chain)."),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .value_parser(value_parser!(String))
                .required(false)
                .help("The format of the image, either 'raw', 'qcow2' or 'auto'."),
        )
        .arg(
            Arg::new("size")
                .short('s')
                .long("size")
                .value_parser(maybe_hex::<u64>)
                .required(false)
                .help("The size (in bytes) to read."),
        )
        .arg(
            Arg::new("offset")
                .short('o')
                .long("offset")
                .value_parser(maybe_hex::<u64>)
                .required(false)
                .help("Read at a specific offset."),
        )
        .arg(
            Arg::new("bitlocker")
                .long("bitlocker")
                .value_parser(maybe_hex::<u64>)
                .required(false)
                .help("Unlock the BitLocker volume starting at this offset before reading."),
        )
        .arg(
            Arg::new("password")
                .short('p')
                .long("password")
                .value_parser(value_parser!(String))
                .required(false)
                .help("BitLocker password or recovery password."),
        )
        .arg(
            Arg::new("vhd")
                .long("vhd")
                .value_parser(value_parser!(String))
                .required(false)
                .help("Capture everything read into a dynamic VHD at this path."),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .action(ArgAction::SetTrue)
                .help("Print the image information as JSON."),
        )
        .arg(
            Arg::new("log_level")
                .short('l')
                .long("log-level")
                .value_parser(["error", "warn", "info", "debug", "trace"])
                .default_value("info")
                .help("Set the log verbosity level"),
        )
        .get_matches();

    let log_level_str = matches.get_one::<String>("log_level").unwrap();
    let level_filter = match log_level_str.as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };

    env_logger::Builder::new().filter_level(level_filter).init();

    let paths: Vec<String> = matches
        .get_many::<String>("body")
        .unwrap()
        .cloned()
        .collect();
    let auto = String::from("auto");
    let format = matches.get_one::<String>("format").unwrap_or(&auto);
    let size = matches.get_one::<u64>("size").unwrap_or(&0);
    let offset = matches.get_one::<u64>("offset").unwrap_or(&0);
    let bitlocker = matches.get_one::<u64>("bitlocker").copied();
    let password = matches.get_one::<String>("password").map(|s| s.as_str());
    let vhd = matches.get_one::<String>("vhd").map(|s| s.as_str());
    let json = matches.get_flag("json");

    process_image(
        &paths, format, *size, *offset, bitlocker, password, vhd, json,
    );
}

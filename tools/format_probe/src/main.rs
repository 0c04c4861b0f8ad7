use anyhow::{Context, Result};
use clap::{Arg, Command};
use gpu_image::config::{Config, ImageConfig};
use gpu_image::device::GpuDevice;
use gpu_image::format::{candidates_for, MemoryFormat};
use gpu_image::image::{select_format, ImageParams};
use gpu_image::probe;

const DEFAULT_SIZE: &str = "256";

#[derive(Debug)]
struct ProbeOptions {
    size: u32,
    show_modifiers: bool,
    only: Option<String>,
}

fn main() -> Result<()> {
    env_logger::init();

    let matches = Command::new("format_probe")
        .about("Reports how each memory format resolves on the local Vulkan device")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Image manager settings (.toml or .ron)"),
        )
        .arg(
            Arg::new("size")
                .short('s')
                .long("size")
                .value_name("PIXELS")
                .help("Edge length of the probed images")
                .default_value(DEFAULT_SIZE),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .value_name("NAME")
                .help("Only probe memory formats whose name contains NAME"),
        )
        .arg(
            Arg::new("modifiers")
                .short('m')
                .long("modifiers")
                .help("List exportable DRM modifiers per native format")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let config = match matches.get_one::<String>("config") {
        Some(path) => ImageConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {}", path))?,
        None => ImageConfig::default(),
    };

    let size = matches
        .get_one::<String>("size")
        .map(String::as_str)
        .unwrap_or(DEFAULT_SIZE)
        .parse()
        .context("Invalid size")?;

    let options = ProbeOptions {
        size,
        show_modifiers: matches.get_flag("modifiers"),
        only: matches.get_one::<String>("format").map(|f| f.to_lowercase()),
    };

    let device = gpu_image::vulkan::create_device(&config).context("Failed to open a Vulkan device")?;
    println!("Device features: {:?}", device.capabilities().features);
    if device.capabilities().force_staging {
        println!("Staging uploads forced");
    }

    log::info!("Probing memory formats at {}x{}", options.size, options.size);
    for format in MemoryFormat::ALL {
        if let Some(filter) = &options.only {
            if !format!("{:?}", format).to_lowercase().contains(filter.as_str()) {
                continue;
            }
        }
        report_format(&device, format, &options);
    }

    Ok(())
}

fn report_format(device: &GpuDevice, format: MemoryFormat, options: &ProbeOptions) {
    println!("{:?}", format);

    let usages = [
        ("upload", ImageParams::upload(false)),
        ("atlas", ImageParams::atlas()),
        ("offscreen", ImageParams::offscreen(false)),
    ];
    for (name, params) in &usages {
        match select_format(device, format, options.size, options.size, params) {
            Ok(selection) => {
                let fallback = if selection.memory_format != format {
                    format!(" (as {:?})", selection.memory_format)
                } else {
                    String::new()
                };
                println!(
                    "  {:<10} {:?} {:?} flags={:?}{}",
                    name, selection.candidate.format, selection.tiling, selection.flags, fallback
                );
            }
            Err(e) => println!("  {:<10} unavailable: {}", name, e),
        }
    }

    if !options.show_modifiers {
        return;
    }
    if let Some(fourcc) = format.dmabuf_fourcc() {
        println!("  fourcc     {}", gpu_image::dmabuf::fourcc_name(fourcc));
    }
    for candidate in candidates_for(format) {
        match probe::export_modifiers(device.backend().as_ref(), candidate.format, options.size, options.size) {
            Some(export) => {
                let modifiers: Vec<String> = export.modifiers.iter().map(|m| format!("{:#018x}", m)).collect();
                println!(
                    "  export     {:?}: [{}] blit={}",
                    candidate.format,
                    modifiers.join(", "),
                    export.can_blit
                );
            }
            None => println!("  export     {:?}: none", candidate.format),
        }
    }
}

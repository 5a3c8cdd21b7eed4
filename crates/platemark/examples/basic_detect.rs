//! Minimal end-to-end run: load a config, detect on one image, print JSON.
//!
//! ```sh
//! cargo run --example basic_detect -- config.json frame.png
//! ```

use platemark::{BgrFrame, Detector, DetectorConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let config_path = args.next().expect("usage: basic_detect <config.json> <image>");
    let image_path = args.next().expect("usage: basic_detect <config.json> <image>");

    let config = DetectorConfig::from_json_file(std::path::Path::new(&config_path))?;
    let detector = Detector::new(config)?;

    let rgb = image::open(&image_path)?.to_rgb8();
    let (w, h) = rgb.dimensions();
    let mut buf = Vec::with_capacity((w * h * 3) as usize);
    for p in rgb.pixels() {
        buf.extend_from_slice(&[p[2], p[1], p[0]]);
    }
    let frame = BgrFrame::new(w, h, &buf)?;

    for result in detector.detect(&frame)? {
        println!("{}", serde_json::to_string(&result)?);
    }
    Ok(())
}

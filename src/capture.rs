use std::path::Path;
use std::sync::OnceLock;

use base64::Engine;
use ffmpeg::util::frame::video::Video;
use ffmpeg::{format, media, rescale};
use ffmpeg_next::{self as ffmpeg};
use image::codecs::jpeg;
use image::ImageBuffer;
use tracing::{debug, info};

use crate::error::Error;

const JPEG_QUALITY: u8 = 90;

static INIT: OnceLock<Result<(), ffmpeg::Error>> = OnceLock::new();

/// Runs `init` on the first call and replays its outcome, failure included,
/// on every later one.
fn remembered<E: Copy>(cell: &OnceLock<Result<(), E>>, init: impl FnOnce() -> Result<(), E>) -> Result<(), E> {
    *cell.get_or_init(init)
}

pub fn init() -> anyhow::Result<()> {
    remembered(&INIT, ffmpeg::init).map_err(|e| anyhow::anyhow!("Failed to initialize FFmpeg: {e}"))
}

/// Duration of the best video stream in seconds, or of the whole container
/// when the stream does not carry one.
pub fn video_duration(input_path: &Path) -> anyhow::Result<f64> {
    let input = format::input(&input_path)?;
    let stream = input
        .streams()
        .best(media::Type::Video)
        .ok_or(anyhow::Error::from(ffmpeg::Error::StreamNotFound))?;

    let time_base: f64 = stream.time_base().into();
    let duration = if stream.duration() > 0 {
        stream.duration() as f64 * time_base
    } else if input.duration() > 0 {
        input.duration() as f64 / f64::from(rescale::TIME_BASE.denominator())
    } else {
        return Err(anyhow::anyhow!("Unknown duration for {}", input_path.display()));
    };
    Ok(duration)
}

/// Whether the `index`th decoded frame is kept when sampling every
/// `stride`th frame.
pub fn is_sampled(index: u64, stride: u32) -> bool {
    index % u64::from(stride.max(1)) == 0
}

/// Output size for a frame so that its longer side is at most
/// `max_dimension`. Never upscales, keeps the aspect ratio and rounds down to
/// even sizes for the scaler.
pub fn fit_within(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max_dimension || longest == 0 {
        return (width.max(2) & !1, height.max(2) & !1);
    }
    let scale = f64::from(max_dimension) / f64::from(longest);
    let scaled = |side: u32| ((f64::from(side) * scale).round() as u32).max(2) & !1;
    (scaled(width), scaled(height))
}

pub fn jpeg_data_url(image_buffer: &ImageBuffer<image::Rgb<u8>, Vec<u8>>) -> anyhow::Result<String> {
    use base64::prelude::BASE64_STANDARD;

    let mut jpeg_data = Vec::new();
    let mut encoder = jpeg::JpegEncoder::new_with_quality(&mut jpeg_data, JPEG_QUALITY);
    encoder.encode(
        image_buffer,
        image_buffer.width(),
        image_buffer.height(),
        image::ExtendedColorType::Rgb8,
    )?;

    Ok("data:image/jpeg;base64,".to_owned() + &BASE64_STANDARD.encode(jpeg_data))
}

/// Decodes the whole video and returns every `stride`th frame as a JPEG data
/// URL, scaled down to `max_dimension`.
pub fn capture_base64(input_path: &Path, stride: u32, max_dimension: u32) -> anyhow::Result<Vec<String>> {
    let mut input = format::input(&input_path)?;
    let video_stream_index = input
        .streams()
        .best(media::Type::Video)
        .ok_or(anyhow::Error::from(ffmpeg::Error::StreamNotFound))?
        .index();

    let video_stream = input
        .stream(video_stream_index)
        .ok_or(anyhow::Error::from(ffmpeg::Error::StreamNotFound))?;
    let context_decoder = ffmpeg::codec::context::Context::from_parameters(video_stream.parameters())?;
    let mut decoder = context_decoder.decoder().video()?;

    let (width, height) = fit_within(decoder.width(), decoder.height(), max_dimension);
    let mut scaler = ffmpeg::software::scaling::context::Context::get(
        decoder.format(),
        decoder.width(),
        decoder.height(),
        format::Pixel::RGB24,
        width,
        height,
        ffmpeg::software::scaling::Flags::BILINEAR,
    )?;
    debug!(
        "Sampling every {stride} frames at {width}x{height} from {}x{}",
        decoder.width(),
        decoder.height()
    );

    let mut frame_index: u64 = 0;
    let mut base64_frames = Vec::new();
    let mut process_decoded_frames =
        |decoder: &mut ffmpeg::decoder::Video| -> Result<(), anyhow::Error> {
            let mut decoded = Video::empty();
            while decoder.receive_frame(&mut decoded).is_ok() {
                let sampled = is_sampled(frame_index, stride);
                frame_index += 1;
                if !sampled {
                    continue;
                }

                let mut rgb_frame = Video::empty();
                scaler.run(&decoded, &mut rgb_frame)?;
                base64_frames.push(jpeg_data_url(&rgb_image(&rgb_frame)?)?);
            }
            Ok(())
        };

    for (stream, packet) in input.packets() {
        if stream.index() == video_stream_index {
            decoder.send_packet(&packet)?;
            process_decoded_frames(&mut decoder)?;
        }
    }
    decoder.send_eof()?;
    process_decoded_frames(&mut decoder)?;

    info!("{} of {} frames sampled", base64_frames.len(), frame_index);
    if base64_frames.is_empty() {
        return Err(Error::NoFrames.into());
    }
    Ok(base64_frames)
}

/// Copies a packed RGB24 frame into an image buffer, dropping the row
/// padding FFmpeg adds to each line.
fn rgb_image(frame: &Video) -> anyhow::Result<ImageBuffer<image::Rgb<u8>, Vec<u8>>> {
    let (width, height) = (frame.width() as usize, frame.height() as usize);
    let stride = frame.stride(0);
    let data = frame.data(0);
    let mut pixels = Vec::with_capacity(width * height * 3);
    for row in data.chunks(stride).take(height) {
        pixels.extend_from_slice(&row[..width * 3]);
    }
    ImageBuffer::from_raw(frame.width(), frame.height(), pixels)
        .ok_or(anyhow::anyhow!("Failed to create image buffer"))
}

use std::path::Path;

use ffmpeg::encoder;
use ffmpeg::util::frame::{audio::Audio, video::Video};
use ffmpeg_next::{
    self as ffmpeg, channel_layout, codec, decoder, filter, format, media, picture, software,
    Dictionary, Error, Packet, Rational, Rescale,
};
use tracing::{debug, info, warn};

use crate::capture;

const AUDIO_BIT_RATE: usize = 128_000;

trait Transcoder {
    fn flush_filter_graph(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn receive_and_process_filtered_frames(
        &mut self,
        _output: &mut format::context::Output,
        _output_stream_time_base: Rational,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn send_packet_to_decoder(&mut self, packet: &Packet) -> anyhow::Result<()>;

    fn send_eof_to_decoder(&mut self) -> anyhow::Result<()>;

    fn receive_and_process_decoded_frames(
        &mut self,
        output: &mut format::context::Output,
        output_stream_time_base: Rational,
    ) -> anyhow::Result<()>;

    fn send_eof_to_encoder(&mut self) -> anyhow::Result<()>;

    fn receive_and_process_encoded_packets(
        &mut self,
        output: &mut format::context::Output,
        output_stream_time_base: Rational,
    ) -> anyhow::Result<()>;

    fn finish(
        &mut self,
        output: &mut format::context::Output,
        output_stream_time_base: Rational,
    ) -> anyhow::Result<()> {
        self.send_eof_to_decoder()?;
        self.receive_and_process_decoded_frames(output, output_stream_time_base)?;
        self.flush_filter_graph()?;
        self.receive_and_process_filtered_frames(output, output_stream_time_base)?;
        self.send_eof_to_encoder()?;
        self.receive_and_process_encoded_packets(output, output_stream_time_base)
    }
}

fn write_encoded_packets(
    encoder: &mut encoder::Encoder,
    output: &mut format::context::Output,
    output_stream_index: usize,
    encoder_time_base: Rational,
    output_stream_time_base: Rational,
) -> anyhow::Result<()> {
    let mut packet = Packet::empty();
    while encoder.receive_packet(&mut packet).is_ok() {
        packet.set_stream(output_stream_index);
        packet.rescale_ts(encoder_time_base, output_stream_time_base);
        packet.write_interleaved(output)?;
    }
    Ok(())
}

/// H.264 through libx264 when the linked FFmpeg has it, MPEG-4 part 2
/// otherwise. Both are valid in an MP4 container.
fn video_codec() -> anyhow::Result<(codec::Codec, bool)> {
    if let Some(codec) = encoder::find_by_name("libx264") {
        return Ok((codec, true));
    }
    warn!("libx264 is not available, encoding video as MPEG-4");
    encoder::find(codec::Id::MPEG4)
        .map(|codec| (codec, false))
        .ok_or(anyhow::anyhow!(Error::EncoderNotFound))
}

/// MPEG-4 part 2 only accepts time base denominators up to 65535, so the
/// fallback encoder counts in frames. libx264 keeps the source's time base.
fn video_time_base(is_x264: bool, input_time_base: Rational, frame_rate: Option<Rational>) -> Rational {
    if is_x264 {
        return input_time_base;
    }
    match frame_rate {
        Some(rate) if rate.numerator() > 0 && rate.denominator() > 0 && rate.numerator() <= 65_535 => {
            rate.invert()
        }
        _ => Rational::new(1, 25),
    }
}

struct VideoTranscoder {
    output_stream_index: usize,
    decoder: decoder::Video,
    encoder: encoder::Video,
    converter: Option<software::scaling::context::Context>,
    input_time_base: Rational,
    encoder_time_base: Rational,
}

impl VideoTranscoder {
    fn new(
        input_stream: &format::stream::Stream,
        output: &mut format::context::Output,
        output_stream_index: usize,
    ) -> anyhow::Result<Self> {
        let global_header = output
            .format()
            .flags()
            .contains(format::Flags::GLOBAL_HEADER);
        let decoder = codec::context::Context::from_parameters(input_stream.parameters())?
            .decoder()
            .video()?;

        let (codec, is_x264) = video_codec()?;
        let pixel_format = match codec.video()?.formats() {
            Some(mut formats) if !formats.any(|pixel| pixel == decoder.format()) => {
                format::Pixel::YUV420P
            }
            _ => decoder.format(),
        };
        let converter = if pixel_format != decoder.format() {
            debug!("Converting {:?} to {:?} for the encoder", decoder.format(), pixel_format);
            Some(software::scaling::context::Context::get(
                decoder.format(),
                decoder.width(),
                decoder.height(),
                pixel_format,
                decoder.width(),
                decoder.height(),
                software::scaling::Flags::BILINEAR,
            )?)
        } else {
            None
        };

        let mut output_stream = output.add_stream(codec)?;
        let mut encoder = codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()?;
        encoder.set_height(decoder.height());
        encoder.set_width(decoder.width());
        encoder.set_aspect_ratio(decoder.aspect_ratio());
        encoder.set_format(pixel_format);
        encoder.set_frame_rate(decoder.frame_rate());
        let frame_rate = decoder
            .frame_rate()
            .or_else(|| Some(input_stream.avg_frame_rate()));
        let encoder_time_base = video_time_base(is_x264, input_stream.time_base(), frame_rate);
        debug!("Encoding video with time base {encoder_time_base}");
        encoder.set_time_base(encoder_time_base);
        output_stream.set_time_base(encoder_time_base);

        if global_header {
            encoder.set_flags(codec::Flags::GLOBAL_HEADER);
        }

        let mut opts = Dictionary::new();
        if is_x264 {
            opts.set("preset", "medium");
        }

        let opened_encoder = encoder.open_with(opts)?;
        output_stream.set_parameters(&opened_encoder);

        Ok(Self {
            output_stream_index,
            decoder,
            encoder: opened_encoder,
            converter,
            input_time_base: input_stream.time_base(),
            encoder_time_base,
        })
    }
}

impl Transcoder for VideoTranscoder {
    fn send_packet_to_decoder(&mut self, packet: &Packet) -> anyhow::Result<()> {
        self.decoder
            .send_packet(packet)
            .map_err(anyhow::Error::from)
    }

    fn send_eof_to_decoder(&mut self) -> anyhow::Result<()> {
        self.decoder.send_eof().map_err(anyhow::Error::from)
    }

    fn receive_and_process_decoded_frames(
        &mut self,
        output: &mut format::context::Output,
        output_stream_time_base: Rational,
    ) -> anyhow::Result<()> {
        let mut frame = Video::empty();
        while self.decoder.receive_frame(&mut frame).is_ok() {
            let timestamp = frame
                .timestamp()
                .ok_or(anyhow::anyhow!("No timestamp"))?
                .rescale(self.input_time_base, self.encoder_time_base);
            frame.set_pts(Some(timestamp));
            frame.set_kind(picture::Type::None);
            match self.converter.as_mut() {
                Some(converter) => {
                    let mut converted = Video::empty();
                    converter.run(&frame, &mut converted)?;
                    converted.set_pts(Some(timestamp));
                    self.encoder.send_frame(&converted)?;
                }
                None => self.encoder.send_frame(&frame)?,
            }
            self.receive_and_process_encoded_packets(output, output_stream_time_base)?;
        }
        Ok(())
    }

    fn send_eof_to_encoder(&mut self) -> anyhow::Result<()> {
        self.encoder.send_eof().map_err(anyhow::Error::from)
    }

    fn receive_and_process_encoded_packets(
        &mut self,
        output: &mut format::context::Output,
        output_stream_time_base: Rational,
    ) -> anyhow::Result<()> {
        write_encoded_packets(
            &mut self.encoder,
            output,
            self.output_stream_index,
            self.encoder_time_base,
            output_stream_time_base,
        )
    }
}

struct AudioTranscoder {
    output_stream_index: usize,
    decoder: decoder::Audio,
    encoder: encoder::Audio,
    filter_graph: filter::Graph,
    encoder_time_base: Rational,
}

impl AudioTranscoder {
    fn new(
        input_stream: &format::stream::Stream,
        output: &mut format::context::Output,
        output_stream_index: usize,
        end_secs: f64,
    ) -> anyhow::Result<Self> {
        let global_header = output
            .format()
            .flags()
            .contains(format::Flags::GLOBAL_HEADER);
        let decoder = codec::context::Context::from_parameters(input_stream.parameters())?
            .decoder()
            .audio()?;

        let codec = encoder::find(codec::Id::AAC)
            .ok_or(anyhow::anyhow!(Error::EncoderNotFound))?
            .audio()?;
        let mut output_stream = output.add_stream(codec)?;
        let context = codec::context::Context::from_parameters(output_stream.parameters())?;
        let mut encoder = context.encoder().audio()?;

        if global_header {
            encoder.set_flags(codec::Flags::GLOBAL_HEADER);
        }

        let input_layout = if !decoder.channel_layout().is_empty() {
            decoder.channel_layout()
        } else if decoder.channels() == 1 {
            channel_layout::ChannelLayout::MONO
        } else {
            channel_layout::ChannelLayout::STEREO
        };
        let channel_layout = codec
            .channel_layouts()
            .map(|layouts| layouts.best(input_layout.channels()))
            .unwrap_or(channel_layout::ChannelLayout::STEREO);

        let encoder_time_base = Rational(1, decoder.rate() as i32);
        encoder.set_channel_layout(channel_layout);
        encoder.set_rate(decoder.rate() as _);
        encoder.set_format(
            codec
                .formats()
                .ok_or(anyhow::anyhow!("Unknown supported formats"))?
                .next()
                .ok_or(anyhow::anyhow!("Failed to get sample format"))?,
        );
        encoder.set_bit_rate(AUDIO_BIT_RATE);
        encoder.set_time_base(encoder_time_base);
        output_stream.set_time_base(encoder_time_base);

        let opened_encoder = encoder.open_as(codec)?;
        output_stream.set_parameters(&opened_encoder);

        let filter_graph = Self::filter_graph(
            &trim_filter_spec(end_secs, decoder.rate()),
            input_stream.time_base(),
            input_layout,
            &decoder,
            &opened_encoder,
        )?;

        Ok(Self {
            output_stream_index,
            decoder,
            encoder: opened_encoder,
            filter_graph,
            encoder_time_base,
        })
    }

    fn filter_graph(
        spec: &str,
        input_time_base: Rational,
        input_layout: channel_layout::ChannelLayout,
        decoder: &codec::decoder::Audio,
        encoder: &codec::encoder::Audio,
    ) -> anyhow::Result<filter::Graph> {
        let mut filter_graph = filter::Graph::new();

        let args = format!(
            "time_base={}:sample_rate={}:sample_fmt={}:channel_layout=0x{:x}",
            input_time_base,
            decoder.rate(),
            decoder.format().name(),
            input_layout.bits()
        );

        filter_graph.add(
            &filter::find("abuffer").ok_or(anyhow::anyhow!("Failed to find filter"))?,
            "in",
            &args,
        )?;
        filter_graph.add(
            &filter::find("abuffersink").ok_or(anyhow::anyhow!("Failed to find filter"))?,
            "out",
            "",
        )?;

        {
            let mut out = filter_graph
                .get("out")
                .ok_or(anyhow::anyhow!("Failed to get filter"))?;
            out.set_sample_format(encoder.format());
            out.set_channel_layout(encoder.channel_layout());
            out.set_sample_rate(encoder.rate());
        }

        filter_graph.output("in", 0)?.input("out", 0)?.parse(spec)?;
        filter_graph.validate()?;

        debug!("Filter graph: {}", filter_graph.dump());

        if let Some(codec) = encoder.codec() {
            if !codec
                .capabilities()
                .contains(codec::capabilities::Capabilities::VARIABLE_FRAME_SIZE)
            {
                filter_graph
                    .get("out")
                    .ok_or(anyhow::anyhow!("Failed to get filter"))?
                    .sink()
                    .set_frame_size(encoder.frame_size());
            }
        }

        Ok(filter_graph)
    }
}

/// Cuts the narration at `end_secs` and restamps it in samples so the
/// encoder sees a gapless track starting at zero.
fn trim_filter_spec(end_secs: f64, sample_rate: u32) -> String {
    format!("atrim=end={end_secs:.3},asettb=1/{sample_rate},asetpts=N")
}

impl Transcoder for AudioTranscoder {
    fn flush_filter_graph(&mut self) -> anyhow::Result<()> {
        self.filter_graph
            .get("in")
            .ok_or(anyhow::anyhow!("Failed to get filter"))?
            .source()
            .flush()
            .map_err(|e| anyhow::anyhow!(e))
    }

    fn receive_and_process_filtered_frames(
        &mut self,
        output: &mut format::context::Output,
        output_stream_time_base: Rational,
    ) -> anyhow::Result<()> {
        let mut frame = Audio::empty();
        while self
            .filter_graph
            .get("out")
            .ok_or(anyhow::anyhow!("Failed to get filter"))?
            .sink()
            .frame(&mut frame)
            .is_ok()
        {
            self.encoder.send_frame(&frame)?;
            self.receive_and_process_encoded_packets(output, output_stream_time_base)?;
        }
        Ok(())
    }

    fn send_packet_to_decoder(&mut self, packet: &Packet) -> anyhow::Result<()> {
        self.decoder
            .send_packet(packet)
            .map_err(anyhow::Error::from)
    }

    fn send_eof_to_decoder(&mut self) -> anyhow::Result<()> {
        self.decoder.send_eof().map_err(anyhow::Error::from)
    }

    fn receive_and_process_decoded_frames(
        &mut self,
        output: &mut format::context::Output,
        output_stream_time_base: Rational,
    ) -> anyhow::Result<()> {
        let mut frame = Audio::empty();
        while self.decoder.receive_frame(&mut frame).is_ok() {
            let timestamp = frame.timestamp().ok_or(anyhow::anyhow!("No timestamp"))?;
            frame.set_pts(Some(timestamp));
            self.filter_graph
                .get("in")
                .ok_or(anyhow::anyhow!("Failed to get filter"))?
                .source()
                .add(&frame)
                .map_err(|e| anyhow::anyhow!(e))?;
            self.receive_and_process_filtered_frames(output, output_stream_time_base)?;
        }
        Ok(())
    }

    fn send_eof_to_encoder(&mut self) -> anyhow::Result<()> {
        self.encoder.send_eof().map_err(anyhow::Error::from)
    }

    fn receive_and_process_encoded_packets(
        &mut self,
        output: &mut format::context::Output,
        output_stream_time_base: Rational,
    ) -> anyhow::Result<()> {
        write_encoded_packets(
            &mut self.encoder,
            output,
            self.output_stream_index,
            self.encoder_time_base,
            output_stream_time_base,
        )
    }
}

fn packet_secs(packet: &Packet, time_base: Rational) -> f64 {
    let ts = packet.pts().or(packet.dts()).unwrap_or(0);
    ts as f64 * f64::from(time_base)
}

/// Writes `output_path` with the video track of `video_path` and the audio of
/// `audio_path` as its only audio track. The video is re-encoded as is; the
/// audio is cut to the video's duration so the result runs exactly as long as
/// the source.
pub fn merge_audio_video(video_path: &Path, audio_path: &Path, output_path: &Path) -> anyhow::Result<()> {
    info!("Merging {} with {}", video_path.display(), audio_path.display());

    let video_secs = capture::video_duration(video_path)?;
    let mut video_input = format::input(&video_path)?;
    let mut audio_input = format::input(&audio_path)?;
    let mut output = format::output(&output_path)?;

    let (mut video_transcoder, video_index, video_time_base) = {
        let ist = video_input
            .streams()
            .best(media::Type::Video)
            .ok_or(anyhow::anyhow!(Error::StreamNotFound))?;
        (VideoTranscoder::new(&ist, &mut output, 0)?, ist.index(), ist.time_base())
    };
    let (mut audio_transcoder, audio_index, audio_time_base) = {
        let ist = audio_input
            .streams()
            .best(media::Type::Audio)
            .ok_or(anyhow::anyhow!(Error::StreamNotFound))?;
        (
            AudioTranscoder::new(&ist, &mut output, 1, video_secs)?,
            ist.index(),
            ist.time_base(),
        )
    };

    output.set_metadata(video_input.metadata().to_owned());
    output.write_header()?;

    let video_ost_time_base = output
        .stream(0)
        .ok_or(anyhow::anyhow!(Error::StreamNotFound))?
        .time_base();
    let audio_ost_time_base = output
        .stream(1)
        .ok_or(anyhow::anyhow!(Error::StreamNotFound))?
        .time_base();

    let mut video_packets = video_input
        .packets()
        .filter(|(stream, _)| stream.index() == video_index)
        .map(|(_, packet)| packet)
        .peekable();
    let mut audio_packets = audio_input
        .packets()
        .filter(|(stream, _)| stream.index() == audio_index)
        .map(|(_, packet)| packet)
        .take_while(|packet| packet_secs(packet, audio_time_base) < video_secs)
        .peekable();

    loop {
        let next_video = video_packets.peek().map(|p| packet_secs(p, video_time_base));
        let next_audio = audio_packets.peek().map(|p| packet_secs(p, audio_time_base));
        match (next_video, next_audio) {
            (None, None) => break,
            (Some(video), Some(audio)) if audio < video => {
                if let Some(packet) = audio_packets.next() {
                    audio_transcoder.send_packet_to_decoder(&packet)?;
                    audio_transcoder.receive_and_process_decoded_frames(&mut output, audio_ost_time_base)?;
                }
            }
            (Some(_), _) => {
                if let Some(packet) = video_packets.next() {
                    video_transcoder.send_packet_to_decoder(&packet)?;
                    video_transcoder.receive_and_process_decoded_frames(&mut output, video_ost_time_base)?;
                }
            }
            (None, Some(_)) => {
                if let Some(packet) = audio_packets.next() {
                    audio_transcoder.send_packet_to_decoder(&packet)?;
                    audio_transcoder.receive_and_process_decoded_frames(&mut output, audio_ost_time_base)?;
                }
            }
        }
    }

    video_transcoder.finish(&mut output, video_ost_time_base)?;
    audio_transcoder.finish(&mut output, audio_ost_time_base)?;

    output.write_trailer()?;
    info!("Wrote {} ({video_secs:.2}s)", output_path.display());

    Ok(())
}

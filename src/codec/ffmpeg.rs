//! FFmpeg backend using rsmpeg.
//!
//! Hardware encoders get an `hw_device_ctx` created from
//! [`HardwareConfig`](crate::output::HardwareConfig) and are fed system memory
//! frames, which covers encoders that upload on their own (nvenc, qsv,
//! videotoolbox).

use super::{
    CodecBackend, CodecError, Container, Encode, EncoderParams, ReceiveOutcome, StreamParams,
};
use crate::media::{Frame, FrameFormat, Packet, PixelFormat, Rational, SampleFormat};
use crate::output::OutputConfig;
use rsmpeg::{
    avcodec::{AVCodec, AVCodecContext, AVCodecParameters, AVPacket},
    avformat::AVFormatContextOutput,
    avutil::{AVChannelLayout, AVDictionary, AVFrame, AVRational},
    error::RsmpegError,
    ffi,
};
use std::collections::BTreeMap;
use std::ffi::{CStr, CString};

fn fault(err: RsmpegError) -> CodecError {
    CodecError::Fault(err.to_string())
}

fn cstring(value: &str) -> Result<CString, CodecError> {
    CString::new(value).map_err(|_| CodecError::Unsupported(format!("invalid name '{}'", value)))
}

fn av_rational(r: Rational) -> AVRational {
    AVRational {
        num: r.num,
        den: r.den,
    }
}

fn rational(r: AVRational) -> Rational {
    Rational::new(r.num, r.den)
}

fn pixel_format(format: PixelFormat) -> ffi::AVPixelFormat {
    match format {
        PixelFormat::Yuv420p => ffi::AV_PIX_FMT_YUV420P,
        PixelFormat::Nv12 => ffi::AV_PIX_FMT_NV12,
        PixelFormat::Yuv444p => ffi::AV_PIX_FMT_YUV444P,
        PixelFormat::Rgba => ffi::AV_PIX_FMT_RGBA,
        PixelFormat::Bgra => ffi::AV_PIX_FMT_BGRA,
    }
}

fn sample_format(format: SampleFormat) -> ffi::AVSampleFormat {
    match format {
        SampleFormat::S16 => ffi::AV_SAMPLE_FMT_S16,
        SampleFormat::S16p => ffi::AV_SAMPLE_FMT_S16P,
        SampleFormat::F32 => ffi::AV_SAMPLE_FMT_FLT,
        SampleFormat::F32p => ffi::AV_SAMPLE_FMT_FLTP,
    }
}

/// Row size in bytes and row count of each plane of a packed [`Frame`].
fn video_planes(format: PixelFormat, width: usize, height: usize) -> Vec<(usize, usize)> {
    let (cw, ch) = (width.div_ceil(2), height.div_ceil(2));
    match format {
        PixelFormat::Yuv420p => vec![(width, height), (cw, ch), (cw, ch)],
        PixelFormat::Nv12 => vec![(width, height), (cw * 2, ch)],
        PixelFormat::Yuv444p => vec![(width, height); 3],
        PixelFormat::Rgba | PixelFormat::Bgra => vec![(width * 4, height)],
    }
}

/// Build a dictionary from string options. `None` when there are none.
fn dictionary(options: &BTreeMap<String, String>) -> Result<Option<AVDictionary>, CodecError> {
    let mut dict: Option<AVDictionary> = None;
    for (key, value) in options {
        let (key, value) = (cstring(key)?, cstring(value)?);
        dict = Some(match dict {
            Some(dict) => dict.set(&key, &value, 0),
            None => AVDictionary::new(&key, &value, 0),
        });
    }
    Ok(dict)
}

/// [`CodecBackend`] backed by libavcodec and libavformat.
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegBackend;

impl FfmpegBackend {
    pub fn new() -> Self {
        Self
    }
}

impl CodecBackend for FfmpegBackend {
    fn open_encoder(&self, params: &EncoderParams) -> Result<Box<dyn Encode>, CodecError> {
        Ok(Box::new(FfmpegEncoder::open(params)?))
    }

    fn open_container(
        &self,
        config: &OutputConfig,
        streams: &[StreamParams],
    ) -> Result<Box<dyn Container>, CodecError> {
        Ok(Box::new(FfmpegContainer::open(config, streams)?))
    }
}

/// An opened `AVCodecContext`, optionally bound to a hardware device.
pub struct FfmpegEncoder {
    codec_ctx: AVCodecContext,
    params: EncoderParams,
    codec_id: ffi::AVCodecID,
    /// Our reference to the device; the codec context holds its own.
    hw_device: Option<*mut ffi::AVBufferRef>,
    can_flush: bool,
}

// SAFETY: the codec context and device buffer are only touched through
// `&mut self`, and FFmpeg contexts may move between threads when not used
// concurrently.
unsafe impl Send for FfmpegEncoder {}

impl FfmpegEncoder {
    pub fn open(params: &EncoderParams) -> Result<Self, CodecError> {
        let name = cstring(&params.codec)?;
        let codec = AVCodec::find_encoder_by_name(&name)
            .ok_or_else(|| CodecError::Unsupported(format!("encoder '{}'", params.codec)))?;

        let mut codec_ctx = AVCodecContext::new(&codec);
        codec_ctx.set_time_base(av_rational(params.time_base));
        if let Some(bitrate) = params.bitrate {
            codec_ctx.set_bit_rate(bitrate as i64);
        }

        match params.format {
            FrameFormat::Video {
                width,
                height,
                pixel_format: format,
            } => {
                if codec.type_ != ffi::AVMEDIA_TYPE_VIDEO {
                    return Err(CodecError::Unsupported(format!(
                        "'{}' is not a video encoder",
                        params.codec
                    )));
                }
                codec_ctx.set_width(width as i32);
                codec_ctx.set_height(height as i32);
                codec_ctx.set_pix_fmt(pixel_format(format));
                if let Some(rate) = params.frame_rate {
                    codec_ctx.set_framerate(av_rational(rate));
                }
                if let Some(gop) = params.gop_size {
                    codec_ctx.set_gop_size(gop as i32);
                }
                // Presentation order equals decode order, so the muxer's
                // per-stream check holds for dts as well.
                codec_ctx.set_max_b_frames(0);
            }
            FrameFormat::Audio {
                sample_rate,
                channels,
                sample_format: format,
            } => {
                if codec.type_ != ffi::AVMEDIA_TYPE_AUDIO {
                    return Err(CodecError::Unsupported(format!(
                        "'{}' is not an audio encoder",
                        params.codec
                    )));
                }
                codec_ctx.set_sample_rate(sample_rate as i32);
                codec_ctx.set_sample_fmt(sample_format(format));
                codec_ctx.set_ch_layout(
                    AVChannelLayout::from_nb_channels(channels as i32).into_inner(),
                );
            }
        }

        let options = dictionary(&params.options)?;
        let hw_device = match &params.hardware {
            Some(hardware) => {
                let device = create_hw_device(&hardware.device_type, hardware.device.as_deref())?;
                // Must be set before open
                unsafe {
                    (*codec_ctx.as_mut_ptr()).hw_device_ctx = ffi::av_buffer_ref(device);
                }
                Some(device)
            }
            None => None,
        };

        if let Err(e) = codec_ctx.open(options) {
            if let Some(mut device) = hw_device {
                unsafe { ffi::av_buffer_unref(&mut device) };
            }
            return Err(CodecError::Allocation(format!(
                "cannot open encoder '{}': {}",
                params.codec, e
            )));
        }

        log::debug!(
            "Opened {} encoder {} (time base {})",
            if hw_device.is_some() { "hardware" } else { "software" },
            params.codec,
            params.time_base
        );

        Ok(Self {
            can_flush: codec.capabilities & ffi::AV_CODEC_CAP_ENCODER_FLUSH as i32 != 0,
            codec_id: codec.id,
            codec_ctx,
            params: params.clone(),
            hw_device,
        })
    }

    fn video_frame(
        &self,
        frame: &Frame,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<AVFrame, CodecError> {
        let mut av_frame = AVFrame::new();
        av_frame.set_format(pixel_format(format));
        av_frame.set_width(width as i32);
        av_frame.set_height(height as i32);
        av_frame.alloc_buffer().map_err(fault)?;

        let mut offset = 0;
        for (plane, (row_bytes, rows)) in video_planes(format, width as usize, height as usize)
            .into_iter()
            .enumerate()
        {
            let dst = av_frame.data[plane];
            let stride = av_frame.linesize[plane] as usize;
            for row in 0..rows {
                let src = &frame.data[offset..offset + row_bytes];
                unsafe {
                    std::ptr::copy_nonoverlapping(src.as_ptr(), dst.add(row * stride), row_bytes);
                }
                offset += row_bytes;
            }
        }
        Ok(av_frame)
    }

    fn audio_frame(
        &self,
        frame: &Frame,
        sample_rate: u32,
        channels: u16,
        format: SampleFormat,
    ) -> Result<AVFrame, CodecError> {
        let mut av_frame = AVFrame::new();
        av_frame.set_format(sample_format(format));
        av_frame.set_sample_rate(sample_rate as i32);
        av_frame.set_ch_layout(AVChannelLayout::from_nb_channels(channels as i32).into_inner());
        av_frame.set_nb_samples(frame.nb_samples as i32);
        av_frame.alloc_buffer().map_err(fault)?;

        let samples = frame.nb_samples as usize;
        let bytes = format.bytes_per_sample();
        if format.is_planar() {
            let plane_bytes = samples * bytes;
            for channel in 0..channels as usize {
                let src = &frame.data[channel * plane_bytes..(channel + 1) * plane_bytes];
                unsafe {
                    let dst = *av_frame.extended_data.add(channel);
                    std::ptr::copy_nonoverlapping(src.as_ptr(), dst, plane_bytes);
                }
            }
        } else {
            let total = samples * bytes * channels as usize;
            unsafe {
                std::ptr::copy_nonoverlapping(frame.data.as_ptr(), av_frame.data[0], total);
            }
        }
        Ok(av_frame)
    }
}

fn create_hw_device(
    device_type: &str,
    device: Option<&str>,
) -> Result<*mut ffi::AVBufferRef, CodecError> {
    let type_name = cstring(device_type)?;
    let kind = unsafe { ffi::av_hwdevice_find_type_by_name(type_name.as_ptr()) };
    if kind == ffi::AV_HWDEVICE_TYPE_NONE {
        return Err(CodecError::Unsupported(format!(
            "hardware device type '{}'",
            device_type
        )));
    }

    let device = device.map(cstring).transpose()?;
    let mut buffer: *mut ffi::AVBufferRef = std::ptr::null_mut();
    let ret = unsafe {
        ffi::av_hwdevice_ctx_create(
            &mut buffer,
            kind,
            device.as_ref().map_or(std::ptr::null(), |d| d.as_ptr()),
            std::ptr::null_mut(),
            0,
        )
    };
    if ret < 0 || buffer.is_null() {
        return Err(CodecError::Allocation(format!(
            "cannot create {} device (error {})",
            device_type, ret
        )));
    }
    Ok(buffer)
}

impl Encode for FfmpegEncoder {
    fn name(&self) -> &str {
        &self.params.codec
    }

    fn time_base(&self) -> Rational {
        rational(self.codec_ctx.time_base)
    }

    fn is_hardware(&self) -> bool {
        self.hw_device.is_some()
    }

    fn stream_params(&self) -> StreamParams {
        let mut params = StreamParams::new(&self.params.codec, self.params.format, self.time_base())
            .with_frame_rate(self.params.frame_rate)
            .with_bitrate(self.params.bitrate);
        params.codecpar = Some(EncoderCodecPar(self.codec_ctx.extract_codecpar()));
        params
    }

    fn send_frame(&mut self, frame: &Frame, pts: Option<i64>) -> Result<(), CodecError> {
        let mut av_frame = match frame.format {
            FrameFormat::Video {
                width,
                height,
                pixel_format,
            } => self.video_frame(frame, width, height, pixel_format)?,
            FrameFormat::Audio {
                sample_rate,
                channels,
                sample_format,
            } => self.audio_frame(frame, sample_rate, channels, sample_format)?,
        };
        av_frame.set_pts(pts.unwrap_or(ffi::AV_NOPTS_VALUE));

        self.codec_ctx.send_frame(Some(&av_frame)).map_err(fault)
    }

    fn send_eof(&mut self) -> Result<(), CodecError> {
        match self.codec_ctx.send_frame(None) {
            Ok(()) | Err(RsmpegError::EncoderFlushedError) => Ok(()),
            Err(e) => Err(fault(e)),
        }
    }

    fn receive_packet(&mut self) -> Result<ReceiveOutcome, CodecError> {
        let packet = match self.codec_ctx.receive_packet() {
            Ok(p) => p,
            Err(RsmpegError::EncoderDrainError) => return Ok(ReceiveOutcome::Again),
            Err(RsmpegError::EncoderFlushedError) => return Ok(ReceiveOutcome::Flushed),
            Err(e) => return Err(fault(e)),
        };

        let data = if packet.data.is_null() || packet.size <= 0 {
            Vec::new()
        } else {
            unsafe { std::slice::from_raw_parts(packet.data, packet.size as usize) }.to_vec()
        };
        let ts = |t: i64| (t != ffi::AV_NOPTS_VALUE).then_some(t);
        Ok(ReceiveOutcome::Packet(
            Packet::new(data, ts(packet.pts), ts(packet.dts), packet.duration)
                .with_keyframe(packet.flags & ffi::AV_PKT_FLAG_KEY as i32 != 0),
        ))
    }

    fn reset(&mut self) -> Result<(), CodecError> {
        if !self.can_flush {
            return Err(CodecError::Unsupported(format!(
                "{} cannot be flushed for reuse",
                self.params.codec
            )));
        }
        unsafe { ffi::avcodec_flush_buffers(self.codec_ctx.as_mut_ptr()) };
        Ok(())
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        if let Some(mut device) = self.hw_device.take() {
            unsafe { ffi::av_buffer_unref(&mut device) };
        }
        log::debug!("Released encoder {} ({:?})", self.params.codec, self.codec_id);
    }
}

/// An output `AVFormatContext` with its header written.
pub struct FfmpegContainer {
    format_ctx: AVFormatContextOutput,
    finished: bool,
}

// SAFETY: only used through `&mut self`; see `FfmpegEncoder`.
unsafe impl Send for FfmpegContainer {}

impl FfmpegContainer {
    pub fn open(config: &OutputConfig, streams: &[StreamParams]) -> Result<Self, CodecError> {
        if streams.is_empty() {
            return Err(CodecError::Unsupported(
                "container without streams".to_string(),
            ));
        }

        let target = cstring(&config.target)?;
        let mut format_ctx = AVFormatContextOutput::create(&target)
            .map_err(|e| CodecError::Io(format!("cannot open {}: {}", config.target, e)))?;

        if let Some(requested) = config.format.as_deref() {
            let guessed = unsafe {
                let oformat = (*format_ctx.as_ptr()).oformat;
                if oformat.is_null() {
                    String::new()
                } else {
                    CStr::from_ptr((*oformat).name).to_string_lossy().into_owned()
                }
            };
            if !guessed.split(',').any(|name| name == requested) {
                return Err(CodecError::Unsupported(format!(
                    "container format '{}' for {} (resolved '{}')",
                    requested, config.target, guessed
                )));
            }
        }

        for params in streams {
            let codecpar = params.codecpar.as_ref().ok_or_else(|| {
                CodecError::Unsupported(format!(
                    "{} stream not produced by an FFmpeg encoder",
                    params.codec
                ))
            })?;
            let mut stream = format_ctx.new_stream();
            stream.set_codecpar(codecpar.0.clone());
            stream.set_time_base(av_rational(params.time_base));
        }

        let mut options = dictionary(&config.muxer_options)?;
        format_ctx
            .write_header(&mut options)
            .map_err(|e| CodecError::Io(format!("cannot write header of {}: {}", config.target, e)))?;

        Ok(Self {
            format_ctx,
            finished: false,
        })
    }
}

/// Codec parameters exported by an opened encoder, ready to be copied onto
/// an output stream.
#[derive(Clone)]
pub struct EncoderCodecPar(AVCodecParameters);

impl std::fmt::Debug for EncoderCodecPar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let par = &*self.0;
        f.debug_struct("EncoderCodecPar")
            .field("codec_id", &par.codec_id)
            .field("extradata_size", &par.extradata_size)
            .finish_non_exhaustive()
    }
}

impl Container for FfmpegContainer {
    fn stream_time_base(&self, index: usize) -> Option<Rational> {
        self.format_ctx
            .streams()
            .get(index)
            .map(|stream| rational(stream.time_base))
    }

    fn write_packet(&mut self, packet: &Packet) -> Result<(), CodecError> {
        if self.finished {
            return Err(CodecError::Io("container already finished".to_string()));
        }

        let mut av_packet = AVPacket::new();
        let ret = unsafe { ffi::av_new_packet(av_packet.as_mut_ptr(), packet.data.len() as i32) };
        if ret < 0 {
            return Err(CodecError::Allocation(format!("packet buffer (error {})", ret)));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(packet.data.as_ptr(), av_packet.data, packet.data.len());
        }
        av_packet.set_pts(packet.pts.unwrap_or(ffi::AV_NOPTS_VALUE));
        av_packet.set_dts(packet.dts.unwrap_or(ffi::AV_NOPTS_VALUE));
        av_packet.set_duration(packet.duration);
        av_packet.set_stream_index(packet.stream_index as i32);
        if packet.is_keyframe {
            av_packet.set_flags(ffi::AV_PKT_FLAG_KEY as i32);
        }

        self.format_ctx
            .interleaved_write_frame(&mut av_packet)
            .map_err(|e| CodecError::Io(e.to_string()))
    }

    fn finish(&mut self) -> Result<(), CodecError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.format_ctx
            .write_trailer()
            .map_err(|e| CodecError::Io(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{CodecParameters, FilterContext, InputContext};
    use crate::output::{process, ClosePolicy, EncoderConfig, OutputContext};
    use crate::pipeline::OutputQueue;

    #[test]
    fn test_video_planes_cover_frame_size() {
        for format in [
            PixelFormat::Yuv420p,
            PixelFormat::Nv12,
            PixelFormat::Yuv444p,
            PixelFormat::Rgba,
        ] {
            let total: usize = video_planes(format, 33, 17)
                .iter()
                .map(|(row, rows)| row * rows)
                .sum();
            assert_eq!(total, format.frame_size(33, 17), "{:?}", format);
        }
    }

    #[test]
    fn test_unknown_encoder_is_unsupported() {
        let params = EncoderParams {
            codec: "no_such_encoder".to_string(),
            format: FrameFormat::Video {
                width: 64,
                height: 64,
                pixel_format: PixelFormat::Yuv420p,
            },
            frame_rate: Some(Rational::new(25, 1)),
            time_base: Rational::new(1, 25),
            bitrate: None,
            gop_size: None,
            hardware: None,
            options: BTreeMap::new(),
        };
        assert!(matches!(
            FfmpegEncoder::open(&params),
            Err(CodecError::Unsupported(_))
        ));
    }

    #[test]
    fn test_stream_params_carry_encoder_codecpar() {
        let params = EncoderParams {
            codec: "mpeg2video".to_string(),
            format: FrameFormat::Video {
                width: 64,
                height: 48,
                pixel_format: PixelFormat::Yuv420p,
            },
            frame_rate: Some(Rational::new(25, 1)),
            time_base: Rational::new(1, 25),
            bitrate: Some(500_000),
            gop_size: Some(12),
            hardware: None,
            options: BTreeMap::new(),
        };
        let encoder = FfmpegEncoder::open(&params).unwrap();
        let stream = encoder.stream_params();
        let codecpar = stream.codecpar.expect("exported by the encoder");

        assert_eq!(codecpar.0.codec_id, encoder.codec_id);
        assert_eq!(codecpar.0.codec_type, ffi::AVMEDIA_TYPE_VIDEO);
        assert_eq!((codecpar.0.width, codecpar.0.height), (64, 48));
        assert_eq!(codecpar.0.bit_rate, 500_000);
    }

    #[test]
    fn test_container_rejects_stream_without_codecpar() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("bare.ts");
        let config = OutputConfig::new(target.to_str().unwrap());
        let format = FrameFormat::Video {
            width: 64,
            height: 64,
            pixel_format: PixelFormat::Yuv420p,
        };
        let streams = [StreamParams::new("mpeg2video", format, Rational::new(1, 25))];
        assert!(matches!(
            FfmpegContainer::open(&config, &streams),
            Err(CodecError::Unsupported(_))
        ));
    }

    #[test]
    fn test_encode_to_mpegts_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("out.ts");
        let target = target.to_str().unwrap();

        let input = InputContext::new().with_stream(
            Rational::new(1, 90_000),
            CodecParameters::video("h264", 64, 64, Rational::new(25, 1)),
        );
        let config = OutputConfig::new(target).with_stream(0, EncoderConfig::new("mpeg2video"));
        let (_tx, queue) = OutputQueue::bounded(1);
        let mut output =
            OutputContext::open(&input, &config, &FfmpegBackend::new(), queue, None).unwrap();

        let filter = FilterContext::video(64, 64, PixelFormat::Yuv420p, Rational::MILLIS);
        for i in 0..10 {
            let frame = Frame::video(64, 64, PixelFormat::Yuv420p, i * 40);
            process(&input, &mut output, 0, &filter, Some(&frame)).unwrap();
        }
        process(&input, &mut output, 0, &filter, None).unwrap();

        let stats = output.stats();
        assert_eq!(stats.video_frames, 10);
        assert_eq!(stats.video_packets, 10);
        output.close(ClosePolicy::ForceClose);

        let size = std::fs::metadata(target).unwrap().len();
        assert!(size > 0);
    }
}

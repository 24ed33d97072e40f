use crate::config::{DestinationConfig, EncoderConfig, EncodingConfig, SourceConfig};
use crate::error::ConfigurationError;
use std::collections::BTreeMap;

/// 一次启动所需的完整进程调用描述，创建后不可变
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// 日志用的地址，密钥已隐藏
    pub redacted_target: String,
}

impl LaunchSpec {
    /// 根据推流目标、视频源和编码参数构建 FFmpeg 调用
    ///
    /// # 错误处理
    /// - 推流地址或密钥为空时返回 `ConfigurationError`
    pub fn build(
        encoder: &EncoderConfig,
        destination: &DestinationConfig,
        source: &SourceConfig,
        encoding: &EncodingConfig,
    ) -> Result<Self, ConfigurationError> {
        let url = destination.url.trim().trim_end_matches('/');
        let key = destination.key.trim();
        if url.is_empty() {
            return Err(ConfigurationError::EmptyUrl);
        }
        if key.is_empty() {
            return Err(ConfigurationError::EmptyKey);
        }
        let target = format!("{}/{}", url, key);
        let redacted_target = format!("{}/****", url);

        let mut args: Vec<String> = vec!["-hide_banner".into(), "-nostdin".into()];

        match source {
            SourceConfig::Pattern { pattern, tone_hz } => {
                args.extend(strs(&["-re", "-f", "lavfi", "-i"]));
                args.push(format!(
                    "{}=size={}x{}:rate={}",
                    pattern, encoding.width, encoding.height, encoding.fps
                ));
                args.extend(strs(&["-f", "lavfi", "-i"]));
                args.push(format!(
                    "sine=frequency={}:sample_rate={}",
                    tone_hz, encoding.audio_sample_rate
                ));
                push_encoding_args(&mut args, encoding);
            }
            SourceConfig::File { path, copy_codecs } => {
                args.extend(strs(&["-re", "-stream_loop", "-1", "-i"]));
                args.push(path.clone());
                if *copy_codecs {
                    args.extend(strs(&["-c:v", "copy", "-c:a", "copy"]));
                } else {
                    push_encoding_args(&mut args, encoding);
                }
            }
        }

        args.extend(strs(&["-f", "flv"]));
        args.push(target);

        // BTreeMap 保证环境变量顺序稳定
        let env = encoder
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<BTreeMap<_, _>>()
            .into_iter()
            .collect();

        Ok(Self {
            program: encoder.binary.clone(),
            args,
            env,
            redacted_target,
        })
    }
}

fn push_encoding_args(args: &mut Vec<String>, encoding: &EncodingConfig) {
    let video_kbps = encoding.video_bitrate_kbps;
    args.extend(strs(&["-c:v", "libx264", "-preset"]));
    args.push(encoding.preset.clone());
    args.push("-b:v".into());
    args.push(format!("{}k", video_kbps));
    args.push("-maxrate".into());
    args.push(format!("{}k", video_kbps));
    args.push("-bufsize".into());
    args.push(format!("{}k", video_kbps * 2));
    args.push("-pix_fmt".into());
    args.push(encoding.pixel_format.clone());
    args.push("-g".into());
    args.push(encoding.gop.to_string());
    args.extend(strs(&["-c:a", "aac", "-b:a"]));
    args.push(format!("{}k", encoding.audio_bitrate_kbps));
    args.push("-ar".into());
    args.push(encoding.audio_sample_rate.to_string());
}

fn strs<'a>(items: &'a [&'a str]) -> impl Iterator<Item = String> + 'a {
    items.iter().map(|s| s.to_string())
}

// Playlist engine: fetches playlists through the pool, follows a master
// playlist to its highest-bandwidth variant, and feeds every newly announced
// segment of a media playlist to the stream writer while re-polling at half
// the advertised target duration.

use std::time::Duration;

use tokio::time;
use tracing::{error, trace, warn};

use weir_net::{ParsedUrl, Pool, parse_url};

use crate::error::RecordError;
use crate::writer::{FetchTarget, StreamWriter};

const HLS_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

const TARGET_DURATION_TAG: &str = "#EXT-X-TARGETDURATION:";
const MEDIA_SEQUENCE_TAG: &str = "#EXT-X-MEDIA-SEQUENCE:";
const DISCONTINUITY_TAG: &str = "#EXT-X-DISCONTINUITY";
const END_LIST_TAG: &str = "#EXT-X-ENDLIST";
const PLAYLIST_TYPE_VOD_TAG: &str = "#EXT-X-PLAYLIST-TYPE:VOD";
const MAP_TAG: &str = "#EXT-X-MAP:";
const STREAM_INF_TAG: &str = "#EXT-X-STREAM-INF:";
const BANDWIDTH_ATTRIBUTE: &str = "BANDWIDTH=";
const URI_ATTRIBUTE: &str = "URI=\"";

const MAX_FILE_STEM_BYTES: usize = 32;
const TS_EXTENSION: &str = ".ts";

/// Records one HLS stream to a transport-stream file in the current working
/// directory, named after the playlist URL's last path component.
pub struct Recorder {
    pool: Pool,
}

impl Recorder {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Resolve, poll, and record `url` until the stream ends or a playlist
    /// error stops polling. Only start-up failures (a malformed URL, an
    /// unopenable output file) are returned; once recording is under way,
    /// errors are logged and the file keeps whatever was written.
    pub async fn record(&self, url: &str) -> Result<(), RecordError> {
        let mut playlist_url =
            parse_url(url).map_err(|_| RecordError::InvalidUrl(url.to_string()))?;
        let file_name = output_file_name(&playlist_url.resource);
        let writer = StreamWriter::open(&file_name, self.pool.clone()).await?;
        trace!(url, file = %file_name, "recording");

        loop {
            let response = match self
                .pool
                .get(playlist_url.scheme, &playlist_url.host, &playlist_url.resource)
                .await
            {
                Ok(response) => response,
                // The pool already logged the failure; stop polling.
                Err(_) => break,
            };
            if !response.is_ok() {
                error!(
                    status = response.status,
                    url = %playlist_url,
                    "unexpected playlist response"
                );
                break;
            }
            let content_type_ok = response
                .content_type
                .as_deref()
                .is_some_and(|value| value.eq_ignore_ascii_case(HLS_CONTENT_TYPE));
            if !content_type_ok {
                error!(
                    content_type = response.content_type.as_deref().unwrap_or(""),
                    url = %playlist_url,
                    "invalid playlist content type"
                );
                break;
            }

            let body = String::from_utf8_lossy(&response.body);
            match parse_playlist(&body) {
                Playlist::Master(Some(variant)) => {
                    trace!(stream_inf = %variant.stream_inf, "received master playlist");
                    match retarget(&playlist_url, &variant.uri) {
                        Some(next) => {
                            trace!(url = %next, "media playlist URL");
                            playlist_url = next;
                        }
                        None => {
                            error!(uri = %variant.uri, "invalid variant URL");
                            break;
                        }
                    }
                }
                Playlist::Master(None) => {
                    error!(url = %playlist_url, "master playlist lists no variants");
                    break;
                }
                Playlist::Media(update) => {
                    let period = self.hand_off(&playlist_url, &writer, update);
                    if period == 0 {
                        break;
                    }
                    time::sleep(Duration::from_secs(period)).await;
                }
            }
        }

        writer.finish().await;
        Ok(())
    }

    /// Push one media-playlist update into the writer and compute the next
    /// poll period; zero means the playlist was terminal.
    fn hand_off(&self, playlist_url: &ParsedUrl, writer: &StreamWriter, update: MediaUpdate) -> u64 {
        if let Some(uri) = &update.init_section {
            writer.add_init_section(resolve_reference(playlist_url, uri));
        }
        let first_sequence = update.segments.first().map(|(sequence, _)| *sequence);
        let segments = update.segments.len();
        for (sequence, uri) in &update.segments {
            writer.add_segment(*sequence, resolve_reference(playlist_url, uri));
        }

        if update.end_list {
            trace!(sequence = first_sequence, segments, "received final playlist");
            0
        } else {
            trace!(
                target_duration = update.target_duration,
                sequence = first_sequence,
                segments,
                "received playlist"
            );
            (update.target_duration / 2).max(1)
        }
    }
}

/// One media playlist's worth of writer input plus the re-poll inputs.
#[derive(Debug, Default, Eq, PartialEq)]
struct MediaUpdate {
    target_duration: u64,
    end_list: bool,
    init_section: Option<String>,
    /// `(media sequence number, URI)` per segment line, in playlist order.
    segments: Vec<(u64, String)>,
}

#[derive(Debug, Eq, PartialEq)]
struct Variant {
    uri: String,
    bandwidth: u64,
    stream_inf: String,
}

#[derive(Debug, Eq, PartialEq)]
enum Playlist {
    /// No `#EXT-X-TARGETDURATION` seen; carries the greatest-bandwidth
    /// variant if the playlist listed any.
    Master(Option<Variant>),
    Media(MediaUpdate),
}

fn parse_playlist(body: &str) -> Playlist {
    let mut media = MediaUpdate::default();
    let mut is_media = false;
    let mut sequence = 0u64;
    let mut bandwidth = 0u64;
    let mut stream_inf = "";
    let mut best: Option<Variant> = None;

    for line in body.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        if let Some(value) = line.strip_prefix(TARGET_DURATION_TAG) {
            media.target_duration = leading_number(value);
            is_media = true;
        } else if let Some(value) = line.strip_prefix(MEDIA_SEQUENCE_TAG) {
            sequence = leading_number(value);
        } else if line.starts_with(DISCONTINUITY_TAG) {
            warn!("playlist discontinuity");
        } else if line.starts_with(END_LIST_TAG) || line.starts_with(PLAYLIST_TYPE_VOD_TAG) {
            media.end_list = true;
        } else if let Some(attributes) = line.strip_prefix(MAP_TAG) {
            if let Some(uri) = quoted_attribute(attributes, URI_ATTRIBUTE) {
                media.init_section = Some(uri.to_string());
            }
        } else if let Some(attributes) = line.strip_prefix(STREAM_INF_TAG) {
            stream_inf = attributes;
            bandwidth = bandwidth_of(attributes);
        } else if !line.starts_with('#') {
            if is_media {
                media.segments.push((sequence, line.to_string()));
            } else if bandwidth > best.as_ref().map_or(0, |variant| variant.bandwidth) {
                best = Some(Variant {
                    uri: line.to_string(),
                    bandwidth,
                    stream_inf: stream_inf.to_string(),
                });
            }
            sequence += 1;
        }
    }

    if is_media {
        Playlist::Media(media)
    } else {
        Playlist::Master(best)
    }
}

/// Digits at the front of `text`, `from_chars` style: parsing stops at the
/// first non-digit and an empty prefix yields zero.
fn leading_number(text: &str) -> u64 {
    let digits = text
        .as_bytes()
        .iter()
        .take_while(|byte| byte.is_ascii_digit())
        .count();
    text[..digits].parse().unwrap_or(0)
}

fn quoted_attribute<'a>(attributes: &'a str, key: &str) -> Option<&'a str> {
    let start = attributes.find(key)? + key.len();
    let rest = &attributes[start..];
    Some(&rest[..rest.find('"')?])
}

fn bandwidth_of(attributes: &str) -> u64 {
    let mut from = 0;
    while let Some(found) = attributes[from..].find(BANDWIDTH_ATTRIBUTE) {
        let at = from + found;
        // Skip AVERAGE-BANDWIDTH and other suffixed attributes.
        if at == 0 || matches!(attributes.as_bytes()[at - 1], b',' | b' ') {
            return leading_number(&attributes[at + BANDWIDTH_ATTRIBUTE.len()..]);
        }
        from = at + BANDWIDTH_ATTRIBUTE.len();
    }
    0
}

/// Resolve a playlist reference against the playlist's own URL: absolute
/// references pass through, a leading `/` replaces the base path, anything
/// else is appended to the base's resource prefix (up to and including the
/// last `/` before any query).
fn resolve_reference(base: &ParsedUrl, reference: &str) -> FetchTarget {
    if reference.starts_with("http://") || reference.starts_with("https://") {
        return FetchTarget::Absolute(reference.to_string());
    }
    let path = if reference.starts_with('/') {
        reference.to_string()
    } else {
        let mut path = base.resource[..resource_prefix_len(&base.resource)].to_string();
        path.push_str(reference);
        path
    };
    FetchTarget::Parts {
        scheme: base.scheme,
        host: base.host.clone(),
        path,
    }
}

fn resource_prefix_len(resource: &str) -> usize {
    let query = resource.find('?').unwrap_or(resource.len());
    match resource[..query].rfind('/') {
        Some(slash) => slash + 1,
        None => 0,
    }
}

fn retarget(base: &ParsedUrl, reference: &str) -> Option<ParsedUrl> {
    match resolve_reference(base, reference) {
        FetchTarget::Absolute(url) => parse_url(&url).ok(),
        FetchTarget::Parts { scheme, host, path } => Some(ParsedUrl {
            scheme,
            host,
            resource: path,
        }),
    }
}

/// Output file name: the playlist URL's last path component with any query
/// stripped and any extension dropped, truncated to 32 bytes (on a character
/// boundary), with `.ts` appended.
fn output_file_name(resource: &str) -> String {
    let query = resource.find('?').unwrap_or(resource.len());
    let path = &resource[..query];
    let name = &path[path.rfind('/').map_or(0, |slash| slash + 1)..];
    let mut end = name
        .rfind('.')
        .unwrap_or(name.len())
        .min(MAX_FILE_STEM_BYTES)
        .min(name.len());
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &name[..end], TS_EXTENSION)
}

use std::path::Path;

const MEDIA_EXTENSIONS: [&str; 9] = [
    "mp4", "mkv", "ts", "avi", "mov", "flac", "mp3", "webm", "wav",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandLine {
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn parse(raw: &[u8]) -> Self {
        let args = raw
            .split(|b| *b == 0)
            .filter(|arg| !arg.is_empty())
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect();
        Self { args }
    }

    pub fn display_name(&self) -> Option<String> {
        let joined = self.args.join(" ");
        let trimmed = joined.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    pub fn program(&self) -> Option<String> {
        let first = self.args.first()?;
        let base = first.rsplit('/').next().unwrap_or(first);
        if base.is_empty() {
            None
        } else {
            Some(base.to_string())
        }
    }
}

pub fn attribute_media(command: &str, display_name: &str, cmdline: &CommandLine) -> Option<String> {
    let command = command.to_lowercase();
    let display_name = display_name.to_lowercase();

    if command.contains("ffmpeg") || display_name.contains("ffmpeg") {
        return input_argument(&cmdline.args);
    }
    if command.contains("plex") || display_name.contains("plex") {
        return input_argument(&cmdline.args).or_else(|| {
            cmdline
                .args
                .iter()
                .find(|arg| has_media_extension(arg))
                .cloned()
        });
    }
    None
}

fn input_argument(args: &[String]) -> Option<String> {
    let idx = args.iter().position(|arg| arg == "-i")?;
    args.get(idx + 1).cloned()
}

fn has_media_extension(arg: &str) -> bool {
    Path::new(arg)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            MEDIA_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media_for(raw: &[u8]) -> Option<String> {
        let cmdline = CommandLine::parse(raw);
        let command = cmdline.program().unwrap_or_default();
        let name = cmdline.display_name().unwrap_or_default();
        attribute_media(&command, &name, &cmdline)
    }

    #[test]
    fn parses_nul_separated_args() {
        let cmdline = CommandLine::parse(b"/usr/bin/ffmpeg\0-i\0in put.mp4\0\0out.mkv\0");
        assert_eq!(cmdline.args, vec!["/usr/bin/ffmpeg", "-i", "in put.mp4", "out.mkv"]);
        assert_eq!(cmdline.program().as_deref(), Some("ffmpeg"));
        assert_eq!(
            cmdline.display_name().as_deref(),
            Some("/usr/bin/ffmpeg -i in put.mp4 out.mkv")
        );
    }

    #[test]
    fn empty_record_has_no_name() {
        let cmdline = CommandLine::parse(b"");
        assert!(cmdline.args.is_empty());
        assert_eq!(cmdline.display_name(), None);
        assert_eq!(cmdline.program(), None);
        assert_eq!(media_for(b""), None);
    }

    #[test]
    fn ffmpeg_uses_input_flag() {
        assert_eq!(
            media_for(b"ffmpeg\0-i\0input.mp4\0output.mkv\0").as_deref(),
            Some("input.mp4")
        );
    }

    #[test]
    fn ffmpeg_without_input_flag_has_no_media() {
        assert_eq!(media_for(b"ffmpeg\0-version\0"), None);
        // Trailing -i with nothing after it.
        assert_eq!(media_for(b"ffmpeg\0-i\0"), None);
    }

    #[test]
    fn plex_falls_back_to_media_extension() {
        assert_eq!(
            media_for(b"plex_transcoder\0-c\0copy\0movie.mkv\0").as_deref(),
            Some("movie.mkv")
        );
        assert_eq!(
            media_for(b"/usr/lib/plexmediaserver/Plex Transcoder\0-codec\0h264\0/media/Show S01E01.MKV\0")
                .as_deref(),
            Some("/media/Show S01E01.MKV")
        );
        assert_eq!(
            media_for(b"/usr/lib/plexmediaserver/Plex Transcoder\0-codec\0h264\0/media/Show.S01E01.MKV\0")
                .as_deref(),
            Some("/media/Show.S01E01.MKV")
        );
    }

    #[test]
    fn plex_prefers_input_flag() {
        assert_eq!(
            media_for(b"Plex Transcoder\0-i\0http://127.0.0.1:32400/stream\0out.ts\0").as_deref(),
            Some("http://127.0.0.1:32400/stream")
        );
    }

    #[test]
    fn match_is_case_insensitive_on_command_or_name() {
        let cmdline = CommandLine::parse(b"/opt/FFmpeg/bin/ff\0-i\0clip.webm\0");
        assert_eq!(
            attribute_media("ff", "/opt/FFmpeg/bin/ff -i clip.webm", &cmdline).as_deref(),
            Some("clip.webm")
        );
    }

    #[test]
    fn other_processes_get_no_media() {
        assert_eq!(media_for(b"vainfo\0-i\0movie.mkv\0"), None);
    }
}

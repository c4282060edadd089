//! Input translation: key names, mouse buttons and xdotool argv.

use crate::protocol::{MouseButton, RpcFailure, ScrollDirection, WindowGeometry};

/// Characters per `xdotool type` invocation; long strings drop keys otherwise.
pub const TYPE_CHUNK_CHARS: usize = 25;

/// Map a caller key name onto its X keysym. Unknown names pass through.
pub fn keysym(key: &str) -> String {
    let lower = key.to_ascii_lowercase();
    let mapped = match lower.as_str() {
        "alt" | "alt_left" => "Alt_L",
        "alt_right" => "Alt_R",
        "backspace" => "BackSpace",
        "break" | "pause" => "Pause",
        "caps_lock" => "Caps_Lock",
        "cmd" | "command" | "super" | "super_left" | "win" | "windows" => "Super_L",
        "super_right" => "Super_R",
        "control" | "control_left" | "ctrl" => "Control_L",
        "control_right" => "Control_R",
        "del" | "delete" => "Delete",
        "down" => "Down",
        "end" => "End",
        "enter" | "return" => "Return",
        "esc" | "escape" => "Escape",
        "home" => "Home",
        "insert" => "Insert",
        "left" => "Left",
        "menu" => "Menu",
        "meta" => "Meta_L",
        "num_lock" => "Num_Lock",
        "page_down" => "Page_Down",
        "page_up" => "Page_Up",
        "print" => "Print",
        "right" => "Right",
        "scroll_lock" => "Scroll_Lock",
        "shift" | "shift_left" => "Shift_L",
        "shift_right" => "Shift_R",
        "space" => "space",
        "tab" => "Tab",
        "up" => "Up",
        _ => return function_key(&lower).unwrap_or_else(|| key.to_string()),
    };
    mapped.to_string()
}

fn function_key(lower: &str) -> Option<String> {
    let n: u8 = lower.strip_prefix('f')?.parse().ok()?;
    (1..=12).contains(&n).then(|| format!("F{n}"))
}

/// xdotool button number.
pub fn button_number(button: MouseButton) -> u8 {
    match button {
        MouseButton::Left => 1,
        MouseButton::Middle => 2,
        MouseButton::Right => 3,
    }
}

/// xdotool wheel button for a scroll direction.
pub fn scroll_button(direction: ScrollDirection) -> u8 {
    match direction {
        ScrollDirection::Up => 4,
        ScrollDirection::Down => 5,
        ScrollDirection::Left => 6,
        ScrollDirection::Right => 7,
    }
}

fn owned(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// `mousemove --sync x y`
pub fn move_args(x: i64, y: i64) -> Vec<String> {
    owned(&["mousemove", "--sync", &x.to_string(), &y.to_string()])
}

/// `click --repeat n button`
pub fn click_args(button: MouseButton, count: u32) -> Vec<String> {
    owned(&[
        "click",
        "--repeat",
        &count.max(1).to_string(),
        &button_number(button).to_string(),
    ])
}

/// `mousedown button` / `mouseup button`
pub fn button_args(button: MouseButton, press: bool) -> Vec<String> {
    let verb = if press { "mousedown" } else { "mouseup" };
    owned(&[verb, &button_number(button).to_string()])
}

/// `click --repeat amount wheel-button`
pub fn scroll_args(direction: ScrollDirection, amount: u32) -> Vec<String> {
    owned(&[
        "click",
        "--repeat",
        &amount.max(1).to_string(),
        &scroll_button(direction).to_string(),
    ])
}

/// `key a+b+c` for a chord of keys pressed together.
///
/// # Errors
/// Returns `INVALID_PARAMS` for an empty key list.
pub fn key_args(keys: &[String]) -> Result<Vec<String>, RpcFailure> {
    if keys.is_empty() || keys.iter().any(|k| k.trim().is_empty()) {
        return Err(RpcFailure::invalid_params("keys must be non-empty"));
    }
    let chord = keys
        .iter()
        .map(|k| keysym(k.trim()))
        .collect::<Vec<_>>()
        .join("+");
    Ok(owned(&["key", "--clearmodifiers", &chord]))
}

/// One `type` argv per chunk of text.
pub fn type_args(text: &str, delay_ms: u64) -> Vec<Vec<String>> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(TYPE_CHUNK_CHARS)
        .map(|chunk| {
            let chunk: String = chunk.iter().collect();
            owned(&["type", "--delay", &delay_ms.to_string(), "--", &chunk])
        })
        .collect()
}

/// Parse `getwindowgeometry --shell` output (`X=`, `Y=`, `WIDTH=`, `HEIGHT=` lines).
pub fn parse_window_geometry(output: &str) -> Option<WindowGeometry> {
    let field = |name: &str| {
        output
            .lines()
            .find_map(|line| line.trim().strip_prefix(name)?.strip_prefix('='))
    };
    Some(WindowGeometry {
        x: field("X")?.parse().ok()?,
        y: field("Y")?.parse().ok()?,
        width: field("WIDTH")?.parse().ok()?,
        height: field("HEIGHT")?.parse().ok()?,
    })
}

/// Parse `getmouselocation` output: `x:12 y:34 screen:0 window:123`.
pub fn parse_mouse_location(output: &str) -> Option<(i64, i64)> {
    let mut x = None;
    let mut y = None;
    for field in output.split_whitespace() {
        if let Some(v) = field.strip_prefix("x:") {
            x = v.parse().ok();
        } else if let Some(v) = field.strip_prefix("y:") {
            y = v.parse().ok();
        }
    }
    Some((x?, y?))
}

/// Parse the current mode from `xrandr` output (`... current 1920 x 1080, ...`).
pub fn parse_xrandr_current(output: &str) -> Option<(u32, u32)> {
    let rest = output.split("current").nth(1)?;
    let mode = rest.split(',').next()?;
    let mut parts = mode.split('x').map(str::trim);
    let width = parts.next()?.parse().ok()?;
    let height = parts.next()?.parse().ok()?;
    Some((width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keysym_aliases() {
        assert_eq!(keysym("ctrl"), "Control_L");
        assert_eq!(keysym("CMD"), "Super_L");
        assert_eq!(keysym("enter"), "Return");
        assert_eq!(keysym("esc"), "Escape");
        assert_eq!(keysym("break"), "Pause");
        assert_eq!(keysym("f11"), "F11");
        assert_eq!(keysym("F13"), "F13");
        assert_eq!(keysym("a"), "a");
        assert_eq!(keysym("Return"), "Return");
    }

    #[test]
    fn test_key_chord() {
        let keys = vec!["ctrl".to_string(), "shift".to_string(), "t".to_string()];
        assert_eq!(
            key_args(&keys).unwrap(),
            ["key", "--clearmodifiers", "Control_L+Shift_L+t"]
        );
        assert!(key_args(&[]).is_err());
    }

    #[test]
    fn test_click_and_scroll_args() {
        assert_eq!(click_args(MouseButton::Right, 2), ["click", "--repeat", "2", "3"]);
        assert_eq!(
            scroll_args(ScrollDirection::Up, 0),
            ["click", "--repeat", "1", "4"]
        );
        assert_eq!(button_args(MouseButton::Middle, true), ["mousedown", "2"]);
    }

    #[test]
    fn test_type_is_chunked() {
        let text = "a".repeat(60);
        let invocations = type_args(&text, 10);
        assert_eq!(invocations.len(), 3);
        assert_eq!(invocations[0].last().unwrap().len(), TYPE_CHUNK_CHARS);
        assert_eq!(invocations[2].last().unwrap().len(), 10);
        assert_eq!(invocations[0][..4], ["type", "--delay", "10", "--"]);
    }

    #[test]
    fn test_type_chunks_on_char_boundaries() {
        let text = "é".repeat(30);
        let invocations = type_args(&text, 0);
        assert_eq!(invocations[0].last().unwrap().chars().count(), TYPE_CHUNK_CHARS);
    }

    #[test]
    fn test_parse_mouse_location() {
        assert_eq!(
            parse_mouse_location("x:120 y:45 screen:0 window:6291463\n"),
            Some((120, 45))
        );
        assert_eq!(parse_mouse_location("garbage"), None);
    }

    #[test]
    fn test_parse_window_geometry() {
        let output = "WINDOW=6291463\nX=10\nY=-4\nWIDTH=800\nHEIGHT=600\nSCREEN=0\n";
        assert_eq!(
            parse_window_geometry(output),
            Some(WindowGeometry {
                x: 10,
                y: -4,
                width: 800,
                height: 600
            })
        );
        assert_eq!(parse_window_geometry("WINDOW=1\nX=0\n"), None);
    }

    #[test]
    fn test_parse_xrandr() {
        let output = "Screen 0: minimum 8 x 8, current 1280 x 720, maximum 32767 x 32767\n";
        assert_eq!(parse_xrandr_current(output), Some((1280, 720)));
        assert_eq!(parse_xrandr_current("nothing here"), None);
    }
}

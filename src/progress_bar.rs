use std::fmt::Write;
use std::io::stdout;
use std::time::Instant;
use crossterm::cursor::{MoveToColumn, MoveToPreviousLine};
use crossterm::execute;
use crossterm::terminal::{Clear, ClearType};

const MIN_BAR_WIDTH: usize = 20;

pub struct ProgressBar {
    bar_buf: String,
    buf: String,
    start_instant: Instant,
    bar_width: usize,
}

impl ProgressBar {
    pub fn new(max_width: usize) -> Self {
        Self {
            buf: String::new(),
            bar_buf: String::new(),
            start_instant: Instant::now(),
            bar_width: crossterm::terminal::size()
                .ok()
                .map(|(cols, _rows)| usize::from(cols))
                .unwrap_or(max_width)
                .min(max_width)
                .max(MIN_BAR_WIDTH),
        }
    }

    /// Two lines: speed, percentage and sizes, then the bar. An unknown total leaves the bar empty.
    fn update(
        &mut self,
        label: &str,
        downloaded_len: u64,
        total_len: Option<u64>,
        speed: u64,
    ) -> Result<&str, std::fmt::Error> {
        let progress = match total_len {
            Some(0) => 100,
            Some(total) => (downloaded_len.min(total) * 100 / total) as usize,
            None => 0,
        };

        let (downloaded_len_size, downloaded_len_unit) = Self::byte_unit(downloaded_len);
        let (speed_size, speed_unit) = Self::byte_unit(speed);

        self.bar_buf.clear();
        self.buf.clear();
        let duration = self.start_instant.elapsed();
        write!(self.bar_buf, "{label} - {speed_size:.2} {speed_unit}/s - ")?;
        match total_len {
            Some(_) => write!(self.bar_buf, "{progress} % - elapsed: {duration:.2?} ")?,
            None => write!(self.bar_buf, "elapsed: {duration:.2?} ")?,
        }
        write!(self.buf, "{downloaded_len_size:.2} {downloaded_len_unit}")?;
        if let Some(total) = total_len {
            let (total_len_size, total_len_unit) = Self::byte_unit(total);
            write!(self.buf, " / {total_len_size:.2} {total_len_unit}")?;
        }
        let padding = self.bar_width.saturating_sub(self.bar_buf.len() + self.buf.len());
        self.bar_buf.extend(std::iter::repeat(' ').take(padding));
        writeln!(self.bar_buf, "{}", self.buf)?;

        let bar_p_width = self.bar_width.saturating_sub(2);
        let progress_width = progress * bar_p_width / 100;
        self.bar_buf.push('[');
        self.bar_buf.extend(std::iter::repeat('█').take(progress_width));
        self.bar_buf.extend(std::iter::repeat(' ').take(bar_p_width - progress_width));
        self.bar_buf.push(']');

        Ok(&self.bar_buf)
    }

    pub fn print(
        &mut self,
        label: &str,
        downloaded_len: u64,
        total_len: Option<u64>,
        speed: u64,
    ) -> std::io::Result<()> {
        let update_value = self
            .update(label, downloaded_len, total_len, speed)
            .map_err(std::io::Error::other)?;
        execute!(
            stdout(),
            Clear(ClearType::CurrentLine),
            MoveToPreviousLine(1),
            Clear(ClearType::CurrentLine),
            MoveToColumn(0),
            crossterm::style::Print(update_value),
        )
    }

    fn byte_unit(bytes_count: u64) -> (f32, &'static str) {
        const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];

        let mut i = 0;
        let mut bytes_count = bytes_count as f32;
        while bytes_count >= 1024.0 && i < UNITS.len() - 1 {
            i += 1;
            bytes_count /= 1024.0;
        }
        (bytes_count, UNITS[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(width: usize) -> ProgressBar {
        ProgressBar {
            bar_buf: String::new(),
            buf: String::new(),
            start_instant: Instant::now(),
            bar_width: width,
        }
    }

    #[test]
    fn should_fill_half_the_bar() {
        let mut bar = bar(42);
        let output = bar.update("a.mp4", 512, Some(1024), 100).unwrap().to_string();
        let line = output.lines().nth(1).unwrap();

        assert!(output.contains("50 %"));
        assert!(output.contains("512.00 B / 1.00 KB"));
        assert_eq!(line.chars().filter(|c| *c == '█').count(), 20);
    }

    #[test]
    fn unknown_total_has_empty_bar() {
        let mut bar = bar(30);
        let output = bar.update("a.bin", 3 * 1024 * 1024, None, 0).unwrap().to_string();

        assert!(output.contains("3.00 MB"));
        assert!(!output.contains('%'));
        assert!(!output.contains('█'));
    }

    #[test]
    fn narrow_terminal_does_not_underflow() {
        let mut bar = bar(2);
        assert!(bar.update("a-very-long-file-name.mp4", 10, Some(10), 1).is_ok());
    }
}

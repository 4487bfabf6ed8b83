use console::style;

const BOX_V: &str = "│";
const BOX_BL: &str = "└";
const BOX_DIAMOND: &str = "◇";

pub fn print_success(msg: &str) {
    println!("{}", style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{}", style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{}", style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{}", style(msg).red().bold());
}

pub fn print_banner() {
    println!();
    println!(" {}", style("clawdbot").bold().cyan());
    println!(" {}", style("personal assistant control plane").dim());
    println!();
}

pub fn print_goodbye() {
    println!("{}", style("bye.").dim());
}

/// Titled, box-drawn section for grouped CLI output.
pub struct Section {
    title: String,
    lines: Vec<String>,
}

impl Section {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            lines: Vec::new(),
        }
    }

    pub fn command(mut self, cmd: &str, description: &str) -> Self {
        self.lines.push(format!(
            "{:<16} {}",
            style(cmd).green(),
            style(description).dim()
        ));
        self
    }

    pub fn status(mut self, label: &str, value: &str) -> Self {
        self.lines
            .push(format!("{:<16} {}", style(label).bold(), value));
        self
    }

    pub fn info(mut self, text: &str) -> Self {
        self.lines.push(style(text).dim().to_string());
        self
    }

    pub fn blank(mut self) -> Self {
        self.lines.push(String::new());
        self
    }

    pub fn print(self) {
        println!(
            " {} {}",
            style(BOX_DIAMOND).cyan(),
            style(&self.title).bold()
        );
        for line in &self.lines {
            println!(" {}  {}", style(BOX_V).dim(), line);
        }
        println!(" {}", style(BOX_BL).dim());
    }
}

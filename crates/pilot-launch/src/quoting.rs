//! Argument quoting (spec §4.3: "Empty arguments are dropped. Each argument
//! is double-quoted after escaping embedded double quotes; an argument
//! already wrapped in single quotes is passed verbatim.").

pub fn quote_argument(arg: &str) -> Option<String> {
    if arg.is_empty() {
        return None;
    }
    if arg.len() >= 2 && arg.starts_with('\'') && arg.ends_with('\'') {
        return Some(arg.to_string());
    }
    Some(format!("\"{}\"", arg.replace('"', "\\\"")))
}

pub fn quote_arguments(args: &[String]) -> Vec<String> {
    args.iter().filter_map(|a| quote_argument(a)).collect()
}

pub fn arg_string(args: &[String]) -> String {
    quote_arguments(args).join(" ")
}

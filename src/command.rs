use std::collections::HashMap;
use std::error::Error;

pub struct Command<T> {
    pub processor: CommandProcessor<T>,
    pub expected_fields: Vec<Field>,
    pub optionals: Vec<VarField>,
    pub desc: String,
}

/// The function that actually executes the command. Accepts the parameters
/// passed into the command, and the state/context object
pub type CommandProcessor<T> =
    fn(invocation: &CommandInvocation, state: Option<T>) -> Result<(), Box<dyn Error>>;

pub type CommandMap<T> = HashMap<String, Command<T>>;

/// Every argument is passed with `--name=value` syntax; required ones are
/// declared as [Field]s, optional ones as [VarField]s.
pub struct CommandInvocation {
    /// The name of the command that was invoked
    pub name: String,

    /// All `--name=value` assignments, declared or not
    pub vars: HashMap<String, String>,

    /// You probably want this: this contains values for expected args.
    pub fields: HashMap<String, String>,
}

impl CommandInvocation {
    pub fn get_field(&self, field_name: &str) -> Option<String> {
        self.fields.get(&field_name.to_owned()).cloned()
    }

    /// Optional `--name=value` arguments that commands may or may not care
    /// about.
    pub fn get_optional(&self, field_name: &str) -> Option<String> {
        self.vars.get(&field_name.to_owned()).cloned()
    }
}

/// A required keyword argument.
pub struct Field {
    pub name: String,
    pub desc: String,
}

/// An optional keyword argument.
#[derive(Clone)]
pub struct VarField {
    pub name: String,
    pub desc: String,
}

impl Field {
    pub fn new(name: &str, desc: &str) -> Self {
        Field {
            name: name.to_owned(),
            desc: desc.to_owned(),
        }
    }
}

impl VarField {
    pub fn new(name: &str, desc: &str) -> Self {
        VarField {
            name: name.to_owned(),
            desc: desc.to_owned(),
        }
    }
}

/// Dispatches to the named command. Returns false if the command was
/// unknown, malformed, or reported an error, so the caller can set the exit
/// code.
pub fn dispatch_command<T>(args: &Vec<String>, map: &CommandMap<T>, state: Option<T>) -> bool {
    if args.is_empty() {
        println!("Missing command. Do 'help' for a list of commands.");
        return false;
    }

    let cmd_name = &args[0];

    if cmd_name == "help" {
        if args.len() < 2 {
            help(map);
        } else {
            help_cmd(map, args[1].clone());
        }

        return true;
    }

    let command = match map.get(cmd_name) {
        Some(obj) => obj.to_owned(),
        None => {
            println!("Unrecognized command: {cmd_name}");
            return false;
        }
    };

    let invocation = match decompose_raw_args(args, &command.expected_fields) {
        Ok(invocation) => invocation,
        Err(err) => {
            println!("{err}");
            return false;
        }
    };

    match (command.processor)(&invocation, state) {
        Err(err) => {
            println!("Error executing command: {err}");
            false
        }
        Ok(_) => true,
    }
}

fn decompose_raw_args(
    raw_args: &Vec<String>,
    expected_fields: &Vec<Field>,
) -> Result<CommandInvocation, Box<dyn Error>> {
    let cmd_name = &raw_args[0];
    let mut assignments: HashMap<String, String> = HashMap::new();

    for arg in &raw_args[1..] {
        let assignment = match arg.strip_prefix("--") {
            Some(rest) => rest,
            None => {
                return Err(format!(
                    "Unexpected argument {arg}. Arguments are passed with --name=<value> syntax"
                ))?
            }
        };

        match assignment.split_once('=') {
            Some((key, value)) => drop(assignments.insert(key.to_owned(), value.to_owned())),
            None => {
                return Err(format!(
                    "Argument --{assignment} has no value. Pass this in with --{assignment}=<value>"
                ))?
            }
        };
    }

    let mut fields: HashMap<String, String> = HashMap::new();

    for Field { name, .. } in expected_fields {
        match assignments.get(name) {
            Some(value) => drop(fields.insert(name.to_owned(), value.clone())),
            None => {
                return Err(format!(
                    "Missing expected argument {name}. Pass this in with --{name}=<value>"
                ))?
            }
        };
    }

    let out = CommandInvocation {
        name: cmd_name.to_owned(),
        vars: assignments,
        fields,
    };

    Ok(out)
}

fn help<T>(map: &CommandMap<T>) {
    println!("These are the supported commands. Do 'help command_name' to learn more about a specific command.\n");
    let mut keys: Vec<String> = map.keys().map(|k| k.to_owned()).collect();
    keys.sort();

    for cmd_name in keys {
        let cmd = map.get(&cmd_name).unwrap();
        println!("\t{}\n\t\t{}", cmd_name, cmd.desc);
    }
}

fn help_cmd<T>(map: &CommandMap<T>, cmd_name: String) {
    let command = match map.get(&cmd_name) {
        Some(obj) => obj.to_owned(),
        None => {
            println!("Unrecognized command: {cmd_name}");
            return;
        }
    };

    println!("{}\n", command.desc);

    if !command.expected_fields.is_empty() {
        println!("Required arguments:\n");

        for field in &command.expected_fields {
            println!("\t--{}=<value>\n\t\t{}", field.name, field.desc);
        }
    }

    if !command.optionals.is_empty() {
        println!("\nOptional arguments:\n");

        for VarField { name, desc } in &command.optionals {
            println!("\t--{name}=<value>\n\t\t{desc}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(invocation: &CommandInvocation, _state: Option<()>) -> Result<(), Box<dyn Error>> {
        assert_eq!(invocation.get_field("address").unwrap(), "abc");
        assert_eq!(invocation.get_optional("data-dir"), None);
        Ok(())
    }

    fn make_map() -> CommandMap<()> {
        let mut map: CommandMap<()> = HashMap::new();
        map.insert(
            String::from("probe"),
            Command {
                processor: probe,
                expected_fields: vec![Field::new("address", "An address")],
                optionals: vec![VarField::new("data-dir", "Store location")],
                desc: String::from("Test probe"),
            },
        );
        map
    }

    #[test]
    fn required_fields_are_parsed() {
        let map = make_map();
        let args = vec![String::from("probe"), String::from("--address=abc")];

        assert!(dispatch_command(&args, &map, None));
    }

    #[test]
    fn missing_required_field_fails() {
        let map = make_map();
        let args = vec![String::from("probe")];

        assert!(!dispatch_command(&args, &map, None));
    }

    #[test]
    fn unknown_command_fails() {
        let map = make_map();
        let args = vec![String::from("frobnicate")];

        assert!(!dispatch_command(&args, &map, None));
    }

    #[test]
    fn stray_arguments_are_rejected() {
        let map = make_map();

        let positional = vec![
            String::from("probe"),
            String::from("--address=abc"),
            String::from("stray"),
        ];
        assert!(!dispatch_command(&positional, &map, None));

        let valueless = vec![String::from("probe"), String::from("--address")];
        assert!(!dispatch_command(&valueless, &map, None));
    }

    #[test]
    fn optionals_are_read_from_vars() {
        let raw = vec![
            String::from("probe"),
            String::from("--address=abc"),
            String::from("--data-dir=/tmp/elsewhere"),
        ];
        let fields = vec![Field::new("address", "")];
        let invocation = decompose_raw_args(&raw, &fields).unwrap();

        assert_eq!(
            invocation.get_optional("data-dir").unwrap(),
            "/tmp/elsewhere"
        );
    }

    #[test]
    fn values_may_contain_equals_signs() {
        let raw = vec![String::from("probe"), String::from("--address=a=b")];
        let fields = vec![Field::new("address", "")];
        let invocation = decompose_raw_args(&raw, &fields).unwrap();

        assert_eq!(invocation.get_field("address").unwrap(), "a=b");
    }
}

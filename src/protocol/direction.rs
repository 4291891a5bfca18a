use std::fmt;

/// Which side of the connection is doing the sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Frontend,
    Backend,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Frontend => f.write_str("frontend"),
            Role::Backend => f.write_str("backend"),
        }
    }
}

/// Roles allowed to send a message variant, as listed in the protocol docs
/// (F, B or F & B).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Frontend,
    Backend,
    Both,
}

impl Direction {
    #[inline]
    pub fn permits(self, role: Role) -> bool {
        matches!(
            (self, role),
            (Direction::Both, _)
                | (Direction::Frontend, Role::Frontend)
                | (Direction::Backend, Role::Backend)
        )
    }
}

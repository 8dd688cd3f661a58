use super::macros::guest_address;

guest_address!(Gfn, u64, "guest frame number");
guest_address!(Pa, u64, "guest physical address");
guest_address!(Va, u64, "guest virtual address");
